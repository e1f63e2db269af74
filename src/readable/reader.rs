//! Exclusive reader of a readable stream.

use super::{ReadableStreamDefaultController, ReadableState, Shared};
use crate::deferred::Settled;
use crate::error::{Error, Reason, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A reader holding the lock of a [`ReadableStream`](super::ReadableStream).
///
/// Dropping the reader releases the lock.
pub struct ReadableStreamDefaultReader<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    closed: Settled<()>,
}

enum ReadStep<T> {
    Done(Result<Option<T>>),
    Pending(oneshot::Receiver<Result<Option<T>>>),
}

/// A read waiting on an empty queue.
///
/// If the read is dropped after a chunk was handed to it but before it was
/// taken, the chunk goes back to the stream.
struct PendingRead<'a, T: Send + 'static> {
    rx: oneshot::Receiver<Result<Option<T>>>,
    shared: &'a Shared<T>,
}

impl<T: Send + 'static> Drop for PendingRead<'_, T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(Some(chunk))) = self.rx.try_recv() {
            tracing::trace!("returning chunk from abandoned read");
            self.shared.lock().restore_chunk(chunk);
        }
    }
}

impl<T: Send + 'static> ReadableStreamDefaultReader<T> {
    pub(super) fn acquire(shared: Arc<Shared<T>>) -> Result<Self> {
        let closed = {
            let mut inner = shared.lock();
            if inner.locked {
                return Err(Error::LockConflict);
            }
            inner.locked = true;
            inner.closed.settled()
        };
        Ok(Self { shared, closed })
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` at end of stream and `Err(Error::Errored(reason))`
    /// once the stream has failed. Dropping the returned future before it
    /// completes never loses a chunk.
    pub async fn read(&self) -> Result<Option<T>> {
        let rx = match self.begin_read() {
            ReadStep::Done(outcome) => return outcome,
            ReadStep::Pending(rx) => rx,
        };
        let mut pending = PendingRead {
            rx,
            shared: &self.shared,
        };
        match (&mut pending.rx).await {
            Ok(Ok(Some(chunk))) => {
                self.shared.lock().chunk_taken();
                Ok(Some(chunk))
            }
            Ok(outcome) => outcome,
            Err(_) => Err(Error::InvalidState("read request dropped by the stream")),
        }
    }

    fn begin_read(&self) -> ReadStep<T> {
        let controller = ReadableStreamDefaultController::new(self.shared.clone());
        let mut inner = self.shared.lock();
        inner.disturbed = true;
        match inner.state {
            ReadableState::Closed => return ReadStep::Done(Ok(None)),
            ReadableState::Errored => return ReadStep::Done(Err(inner.stored_error())),
            ReadableState::Readable => {}
        }

        if let Some(chunk) = inner.queue.dequeue() {
            if inner.close_requested {
                inner.close_if_drained();
            } else {
                drop(inner);
                controller.call_pull_if_needed();
            }
            return ReadStep::Done(Ok(Some(chunk)));
        }

        let (tx, rx) = oneshot::channel();
        inner.read_requests.push_back(tx);
        drop(inner);
        controller.call_pull_if_needed();
        ReadStep::Pending(rx)
    }

    /// Cancel the stream through this reader.
    pub fn cancel(&self, reason: impl Into<Reason>) -> Settled<()> {
        ReadableStreamDefaultController::new(self.shared.clone()).cancel_stream(reason.into())
    }

    /// Resolves when the stream closes; rejects with the stream's error.
    pub fn closed(&self) -> Settled<()> {
        self.closed.clone()
    }

    pub(crate) fn state(&self) -> ReadableState {
        self.shared.lock().state
    }

    /// Release the lock so another reader can be acquired.
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T: Send + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.locked = false;
        for request in inner.read_requests.drain(..) {
            let _ = request.send(Err(Error::InvalidState(
                "reader released while a read was pending",
            )));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader")
            .field("state", &self.shared.lock().state)
            .finish()
    }
}
