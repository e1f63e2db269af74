//! # Streamflow
//!
//! Backpressure-aware readable, writable and transform streams on Tokio.
//!
//! A [`ReadableStream`] pulls chunks from an [`UnderlyingSource`] into a
//! bounded queue, a [`WritableStream`] feeds chunks one at a time into an
//! [`UnderlyingSink`], and a [`TransformStream`] joins the two with a
//! [`Transformer`] in between. Queues are sized by a [`QueuingStrategy`];
//! once the queued total reaches the high-water mark, producers are asked
//! to wait.
//!
//! ## Quick Start
//!
//! ```rust
//! use streamflow::prelude::*;
//!
//! struct Double;
//!
//! impl Transformer<u32, u32> for Double {
//!     async fn transform(
//!         &self,
//!         chunk: u32,
//!         controller: &TransformStreamDefaultController<u32>,
//!     ) -> AlgorithmResult {
//!         controller.enqueue(chunk * 2)?;
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> streamflow::Result<()> {
//! let source = ReadableStream::from_iter(vec![1, 2, 3])?;
//! let doubled = source.pipe_through(
//!     &TransformStream::from_transformer(Double)?,
//!     PipeOptions::default(),
//! )?;
//! assert_eq!(doubled.collect().await?, vec![2, 4, 6]);
//! # Ok(())
//! # }
//! ```
//!
//! Every stream must be created inside a Tokio runtime: source, sink and
//! transformer algorithms run as spawned tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deferred;
pub mod error;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod signal;
pub mod strategy;
pub mod transform;
pub mod writable;

mod task;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::deferred::{Deferred, Settled};
    pub use crate::error::{AlgorithmResult, Error, Reason, Result};
    pub use crate::pipe::PipeOptions;
    pub use crate::readable::{
        ReadableState, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamDefaultReader, UnderlyingSource,
    };
    pub use crate::signal::{AbortController, AbortSignal};
    pub use crate::strategy::QueuingStrategy;
    pub use crate::transform::{
        TransformStream, TransformStreamDefaultController, Transformer,
    };
    pub use crate::writable::{
        UnderlyingSink, WritableState, WritableStream, WritableStreamDefaultController,
        WritableStreamDefaultWriter,
    };
}

pub use error::{AlgorithmResult, Error, Reason, Result};
pub use pipe::PipeOptions;
pub use readable::{ReadableStream, UnderlyingSource};
pub use strategy::QueuingStrategy;
pub use transform::{TransformStream, Transformer};
pub use writable::{UnderlyingSink, WritableStream};
