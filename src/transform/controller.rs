//! Handle passed to a [`Transformer`](super::Transformer).

use super::{TransformLink, TransformTerminated};
use crate::error::{Error, Reason, Result};
use crate::readable::ReadableStreamDefaultController;
use std::fmt;
use std::sync::Arc;

/// Output side of a transform, as seen by its transformer.
pub struct TransformStreamDefaultController<O> {
    readable: ReadableStreamDefaultController<O>,
    link: Arc<dyn TransformLink>,
}

impl<O: Send + 'static> TransformStreamDefaultController<O> {
    pub(super) fn new(
        readable: ReadableStreamDefaultController<O>,
        link: Arc<dyn TransformLink>,
    ) -> Self {
        Self { readable, link }
    }

    /// Emit an output chunk on the readable side.
    ///
    /// Fails with [`Error::InvalidState`] once the readable side is closed,
    /// closing or errored. If the readable side cannot take the chunk, the
    /// writable side is errored with the same failure.
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        if !self.readable.can_close_or_enqueue() {
            return Err(Error::InvalidState(
                "readable side is not accepting chunks",
            ));
        }
        if let Err(err) = self.readable.enqueue(chunk) {
            self.link.error_writable_and_unblock_write(err.clone().into_reason());
            return Err(err);
        }
        if self.readable.has_backpressure() {
            self.link.apply_backpressure();
        }
        Ok(())
    }

    /// Error both sides with `reason`.
    pub fn error(&self, reason: impl Into<Reason>) {
        let reason = reason.into();
        self.readable.error(reason.clone());
        self.link.error_writable_and_unblock_write(reason);
    }

    /// Close the readable side and error the writable side.
    pub fn terminate(&self) {
        if self.readable.can_close_or_enqueue() {
            let _ = self.readable.close();
        }
        self.link
            .error_writable_and_unblock_write(Reason::from_error(TransformTerminated));
    }

    /// Desired size of the readable side.
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            link: self.link.clone(),
        }
    }
}

impl<O> fmt::Debug for TransformStreamDefaultController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStreamDefaultController")
            .field("readable", &self.readable)
            .finish_non_exhaustive()
    }
}
