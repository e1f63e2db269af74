//! Writable streams: a serialized, backpressured sink for chunks.
//!
//! Producers lock a [`WritableStream`] with [`WritableStream::get_writer`]
//! and submit chunks with [`WritableStreamDefaultWriter::write`]. Writes are
//! queued immediately and handed to the [`UnderlyingSink`] one at a time;
//! the future returned by `write` settles when the sink has processed that
//! chunk.
//!
//! # States
//!
//! ```text
//! Writable ──close()──▶ Closing ──sink close ok──▶ Closed
//!     │
//!     └──abort()/error──▶ Erroring ──in-flight work settled──▶ Errored
//! ```

mod controller;
mod sink;
mod writer;

pub use controller::WritableStreamDefaultController;
pub use sink::UnderlyingSink;
pub use writer::WritableStreamDefaultWriter;

pub(crate) use controller::WeakWritableController;

use crate::deferred::{Deferred, Settled};
use crate::error::{Error, Reason, Result};
use crate::queue::SizedQueue;
use crate::signal::AbortController;
use crate::strategy::QueuingStrategy;
use crate::task::Spawner;
use sink::DynSink;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle state of a writable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    /// Accepting writes.
    Writable,
    /// A close has been requested; queued writes are still draining.
    Closing,
    /// The sink closed successfully. Terminal.
    Closed,
    /// Failing; waiting for in-flight sink work to settle.
    Erroring,
    /// The stream failed. Terminal.
    Errored,
}

/// A queued sink operation.
enum WriteRecord<T> {
    /// A chunk; emptied once handed to the sink.
    Chunk(Option<T>),
    /// The close marker, always last.
    Close,
}

struct PendingAbort {
    deferred: Deferred<()>,
    reason: Reason,
    was_already_erroring: bool,
}

pub(crate) struct Shared<T> {
    inner: Mutex<WritableInner<T>>,
    spawner: Spawner,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, WritableInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WritableInner<T> {
    /// Never `Closing`; that is derived from the close request slots.
    state: WritableState,
    stored_error: Option<Reason>,
    locked: bool,
    /// One per queued chunk, in queue order.
    write_requests: VecDeque<Deferred<()>>,
    in_flight_write: Option<Deferred<()>>,
    close_request: Option<Deferred<()>>,
    in_flight_close: Option<Deferred<()>>,
    pending_abort: Option<PendingAbort>,
    backpressure: bool,
    ready: Deferred<()>,
    closed: Deferred<()>,
    queue: SizedQueue<WriteRecord<T>>,
    strategy: QueuingStrategy<T>,
    started: bool,
    sink: Option<Arc<dyn DynSink<T>>>,
    abort_controller: AbortController,
}

impl<T> WritableInner<T> {
    fn new(strategy: QueuingStrategy<T>, sink: Arc<dyn DynSink<T>>) -> Self {
        let backpressure = strategy.high_water_mark() <= 0.0;
        Self {
            state: WritableState::Writable,
            stored_error: None,
            locked: false,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            backpressure,
            ready: if backpressure {
                Deferred::new()
            } else {
                Deferred::resolved(())
            },
            closed: Deferred::new(),
            queue: SizedQueue::new(),
            strategy,
            started: false,
            sink: Some(sink),
            abort_controller: AbortController::new(),
        }
    }

    fn public_state(&self) -> WritableState {
        match self.state {
            WritableState::Writable if self.close_queued_or_in_flight() => WritableState::Closing,
            state => state,
        }
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn stored_error(&self) -> Error {
        Error::Errored(
            self.stored_error
                .clone()
                .unwrap_or_else(|| Reason::new("writable stream errored")),
        )
    }

    fn queue_desired_size(&self) -> f64 {
        self.queue.desired_size(self.strategy.high_water_mark())
    }

    /// Desired size as seen by a writer.
    fn desired_size(&self) -> Option<f64> {
        match self.state {
            WritableState::Erroring | WritableState::Errored => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable | WritableState::Closing => Some(self.queue_desired_size()),
        }
    }

    fn clear_algorithms(&mut self) {
        self.sink = None;
    }

    fn update_backpressure(&mut self) {
        let backpressure = self.queue_desired_size() <= 0.0;
        if backpressure == self.backpressure {
            return;
        }
        if backpressure {
            self.ready = Deferred::new();
        } else {
            self.ready.resolve(());
        }
        self.backpressure = backpressure;
    }

    fn reject_ready(&mut self, err: Error) {
        if self.ready.is_settled() {
            self.ready = Deferred::rejected(err);
        } else {
            self.ready.reject(err);
        }
    }

    fn reject_close_and_closed(&mut self) {
        let err = self.stored_error();
        if let Some(request) = self.close_request.take() {
            request.reject(err.clone());
        }
        self.closed.reject(err);
    }
}

/// A writable stream of `T` chunks.
///
/// Cloning yields another handle to the same stream.
pub struct WritableStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream that feeds `sink`.
    ///
    /// Must be called inside a Tokio runtime; `sink.start()` is spawned on
    /// it immediately. Fails with [`Error::InvalidState`] if the strategy's
    /// high-water mark is invalid or no runtime is running.
    pub fn new<S>(sink: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSink<T>,
    {
        strategy.validate()?;
        let spawner = Spawner::current()?;
        let sink: Arc<dyn DynSink<T>> = Arc::new(sink);
        let shared = Arc::new(Shared {
            inner: Mutex::new(WritableInner::new(strategy, sink.clone())),
            spawner,
        });
        WritableStreamDefaultController::new(shared.clone()).start(sink);
        Ok(Self { shared })
    }

    /// Check whether a writer currently holds the stream.
    pub fn locked(&self) -> bool {
        self.shared.lock().locked
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> WritableState {
        self.shared.lock().public_state()
    }

    /// Lock the stream to a new writer.
    ///
    /// Fails with [`Error::LockConflict`] if a writer is already active.
    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<T>> {
        WritableStreamDefaultWriter::acquire(self.shared.clone())
    }

    /// Abort the stream. Rejects with [`Error::LockConflict`] while locked.
    pub fn abort(&self, reason: impl Into<Reason>) -> Settled<()> {
        if self.locked() {
            return Deferred::rejected(Error::LockConflict).settled();
        }
        self.controller().abort(reason.into())
    }

    /// Close the stream. Rejects with [`Error::LockConflict`] while locked.
    pub fn close(&self) -> Settled<()> {
        if self.locked() {
            return Deferred::rejected(Error::LockConflict).settled();
        }
        self.controller().close()
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController<T> {
        WritableStreamDefaultController::new(self.shared.clone())
    }
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("WritableStream")
            .field("state", &inner.public_state())
            .field("locked", &inner.locked)
            .field("queued", &inner.queue.len())
            .finish()
    }
}
