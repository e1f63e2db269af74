//! Exclusive writer of a writable stream.

use super::{Shared, WritableState, WritableStreamDefaultController};
use crate::deferred::Settled;
use crate::error::{Error, Reason, Result};
use std::fmt;
use std::sync::Arc;

/// A writer holding the lock of a [`WritableStream`](super::WritableStream).
///
/// Dropping the writer releases the lock; writes already submitted keep
/// running.
pub struct WritableStreamDefaultWriter<T: Send + 'static> {
    controller: WritableStreamDefaultController<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WritableStreamDefaultWriter<T> {
    pub(super) fn acquire(shared: Arc<Shared<T>>) -> Result<Self> {
        {
            let mut inner = shared.lock();
            if inner.locked {
                return Err(Error::LockConflict);
            }
            inner.locked = true;
        }
        Ok(Self {
            controller: WritableStreamDefaultController::new(shared.clone()),
            shared,
        })
    }

    /// Submit a chunk.
    ///
    /// The chunk is queued before this returns, so writes issued one after
    /// another keep their order even if the returned handles are never
    /// awaited. Awaiting the handle waits for the sink to process the chunk.
    /// Producers that respect backpressure await [`ready`](Self::ready)
    /// before writing.
    pub fn write(&self, chunk: T) -> Settled<()> {
        self.controller.write(chunk)
    }

    /// Close the stream once every queued write has been processed.
    pub fn close(&self) -> Settled<()> {
        self.controller.close()
    }

    /// Abort the stream, discarding queued writes.
    pub fn abort(&self, reason: impl Into<Reason>) -> Settled<()> {
        self.controller.abort(reason.into())
    }

    /// Resolves while the stream has room below its high-water mark;
    /// rejects once the stream is erroring or errored.
    pub fn ready(&self) -> Settled<()> {
        self.shared.lock().ready.settled()
    }

    /// Resolves when the stream closes; rejects with the stream's error.
    pub fn closed(&self) -> Settled<()> {
        self.shared.lock().closed.settled()
    }

    /// `high_water_mark - queued size`; `None` while erroring or errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.lock().desired_size()
    }

    pub(crate) fn state(&self) -> WritableState {
        self.shared.lock().public_state()
    }

    pub(crate) fn close_with_error_propagation(&self) -> Settled<()> {
        self.controller.close_with_error_propagation()
    }

    /// Release the lock so another writer can be acquired.
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T: Send + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.shared.lock().locked = false;
    }
}

impl<T: Send + 'static> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("WritableStreamDefaultWriter")
            .field("state", &inner.public_state())
            .field("desired_size", &inner.desired_size())
            .finish()
    }
}
