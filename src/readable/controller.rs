//! Producer-side handle of a readable stream.

use super::source::DynSource;
use super::{ReadableState, Shared};
use crate::deferred::{Deferred, Settled};
use crate::error::{Error, Reason, Result};
use std::fmt;
use std::sync::{Arc, Weak};

/// Handle through which an [`UnderlyingSource`](super::UnderlyingSource)
/// feeds its stream.
///
/// The controller can be cloned and moved to other tasks; it stays valid
/// for the lifetime of the stream.
pub struct ReadableStreamDefaultController<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ReadableStreamDefaultController<T> {
    pub(super) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Queue a chunk, or hand it straight to a waiting reader.
    ///
    /// Fails with [`Error::InvalidState`] once the stream is closed, closing
    /// or errored. If the size algorithm fails, the stream is errored with
    /// that failure and [`Error::SizeComputation`] is returned.
    ///
    /// The size algorithm runs while the stream's state is locked and must
    /// not call back into the stream.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        {
            let mut inner = self.shared.lock();
            if !inner.can_close_or_enqueue() {
                return Err(Error::InvalidState(
                    "cannot enqueue into a stream that is closed, closing or errored",
                ));
            }
            if let Some(chunk) = inner.fulfill_read_request(chunk) {
                inner.enqueue_sized(chunk, false)?;
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    /// Close the stream once the queued chunks have been read.
    ///
    /// A chunk already handed to a waiting read counts as unread until the
    /// reader takes it.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if !inner.can_close_or_enqueue() {
            return Err(Error::InvalidState(
                "cannot close a stream that is closed, closing or errored",
            ));
        }
        inner.close_requested = true;
        inner.close_if_drained();
        Ok(())
    }

    /// Error the stream. Queued chunks are discarded and every pending and
    /// future read fails with `reason`.
    ///
    /// Has no effect unless the stream is readable.
    pub fn error(&self, reason: impl Into<Reason>) {
        self.shared.lock().error(reason.into());
    }

    /// `high_water_mark - queued size`; `None` once errored, `0` once closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.lock().desired_size()
    }

    /// Check whether the stream would ignore a `pull()` right now.
    pub(crate) fn has_backpressure(&self) -> bool {
        !self.shared.lock().should_call_pull()
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.shared.lock().can_close_or_enqueue()
    }

    /// The stored error once the stream has errored.
    pub(crate) fn errored_reason(&self) -> Option<Reason> {
        let inner = self.shared.lock();
        match inner.state {
            ReadableState::Errored => inner.stored_error.clone(),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakReadableController<T> {
        WeakReadableController {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(super) fn start(&self, source: Arc<dyn DynSource<T>>) {
        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            match source.start(&controller).await {
                Ok(()) => {
                    controller.shared.lock().started = true;
                    controller.call_pull_if_needed();
                }
                Err(reason) => controller.error(reason),
            }
        });
    }

    pub(super) fn call_pull_if_needed(&self) {
        let source = {
            let mut inner = self.shared.lock();
            if !inner.should_call_pull() {
                return;
            }
            if inner.pulling {
                inner.pull_again = true;
                return;
            }
            let Some(source) = inner.source.clone() else {
                return;
            };
            inner.pulling = true;
            source
        };

        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            match source.pull(&controller).await {
                Ok(()) => {
                    let again = {
                        let mut inner = controller.shared.lock();
                        inner.pulling = false;
                        std::mem::take(&mut inner.pull_again)
                    };
                    if again {
                        controller.call_pull_if_needed();
                    }
                }
                Err(reason) => controller.error(reason),
            }
        });
    }

    /// Cancel the stream: close it, drop queued chunks and run the source's
    /// cancel algorithm. Every call after the first returns the first call's
    /// outcome.
    pub(crate) fn cancel_stream(&self, reason: Reason) -> Settled<()> {
        let (source, deferred) = {
            let mut inner = self.shared.lock();
            inner.disturbed = true;
            if let Some(outcome) = &inner.cancel_outcome {
                return outcome.clone();
            }
            match inner.state {
                ReadableState::Closed => return Deferred::resolved(()).settled(),
                ReadableState::Errored => return Deferred::rejected(inner.stored_error()).settled(),
                ReadableState::Readable => {}
            }
            tracing::debug!(
                "readable stream cancelled: {}, dropping {:?}",
                reason,
                inner.queue.stats()
            );
            inner.close();
            inner.queue.reset();
            let deferred = Deferred::new();
            inner.cancel_outcome = Some(deferred.settled());
            (inner.source.take(), deferred)
        };

        let outcome = deferred.settled();
        match source {
            Some(source) => self.shared.spawner.spawn(async move {
                let result = source.cancel(reason).await;
                deferred.settle(result.map_err(Error::Errored));
            }),
            None => {
                deferred.resolve(());
            }
        }
        outcome
    }
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for ReadableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ReadableStreamDefaultController")
            .field("state", &inner.state)
            .field("desired_size", &inner.desired_size())
            .finish()
    }
}

/// Non-owning controller reference held by objects the stream itself owns.
pub(crate) struct WeakReadableController<T> {
    shared: Weak<Shared<T>>,
}

impl<T: Send + 'static> WeakReadableController<T> {
    pub(crate) fn upgrade(&self) -> Option<ReadableStreamDefaultController<T>> {
        self.shared.upgrade().map(ReadableStreamDefaultController::new)
    }
}

impl<T> Clone for WeakReadableController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::{ReadableStream, UnderlyingSource};
    use crate::strategy::QueuingStrategy;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        controller: Mutex<Option<ReadableStreamDefaultController<i32>>>,
        cancelled: Mutex<Vec<Reason>>,
    }

    struct Manual(Arc<Captured>);

    impl UnderlyingSource<i32> for Manual {
        async fn start(
            &self,
            controller: &ReadableStreamDefaultController<i32>,
        ) -> crate::error::AlgorithmResult {
            *self.0.controller.lock().unwrap() = Some(controller.clone());
            Ok(())
        }

        async fn cancel(&self, reason: Reason) -> crate::error::AlgorithmResult {
            self.0.cancelled.lock().unwrap().push(reason);
            Ok(())
        }
    }

    async fn manual_stream(
        hwm: f64,
    ) -> (
        ReadableStream<i32>,
        ReadableStreamDefaultController<i32>,
        Arc<Captured>,
    ) {
        let captured = Arc::new(Captured::default());
        let strategy = QueuingStrategy::count(hwm);
        let stream = ReadableStream::new(Manual(captured.clone()), strategy).unwrap();
        tokio::task::yield_now().await;
        let controller = captured.controller.lock().unwrap().clone().unwrap();
        (stream, controller, captured)
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_invalid() {
        let (_stream, controller, _) = manual_stream(1.0).await;
        controller.enqueue(1).unwrap();
        controller.close().unwrap();
        assert!(matches!(controller.enqueue(2), Err(Error::InvalidState(_))));
        assert!(matches!(controller.close(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_desired_size_tracks_queue() {
        let (stream, controller, _) = manual_stream(2.0).await;
        assert_eq!(controller.desired_size(), Some(2.0));
        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        controller.enqueue(3).unwrap();
        assert_eq!(controller.desired_size(), Some(-1.0));

        controller.error("broken");
        assert_eq!(controller.desired_size(), None);
        assert_eq!(stream.state(), ReadableState::Errored);
    }

    #[tokio::test]
    async fn test_size_failure_errors_stream() {
        let captured = Arc::new(Captured::default());
        let strategy = QueuingStrategy::with_size(4.0, |chunk: &i32| {
            if *chunk < 0 {
                Err(Reason::new("negative"))
            } else {
                Ok(1.0)
            }
        });
        let stream = ReadableStream::new(Manual(captured.clone()), strategy).unwrap();
        tokio::task::yield_now().await;
        let controller = captured.controller.lock().unwrap().clone().unwrap();

        controller.enqueue(1).unwrap();
        let err = controller.enqueue(-1).unwrap_err();
        assert!(matches!(err, Error::SizeComputation(_)));
        assert_eq!(stream.state(), ReadableState::Errored);

        let reader = stream.get_reader().unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.reason().unwrap().to_string(), "negative");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (stream, controller, captured) = manual_stream(1.0).await;
        controller.enqueue(7).unwrap();

        let first = stream.cancel("done").await;
        let second = stream.cancel("again").await;
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(captured.cancelled.lock().unwrap().len(), 1);
        assert_eq!(stream.state(), ReadableState::Closed);
        assert!(stream.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_failure_is_replayed() {
        struct Failing;
        impl UnderlyingSource<u8> for Failing {
            async fn cancel(&self, _reason: Reason) -> crate::error::AlgorithmResult {
                Err(Reason::new("cannot cancel"))
            }
        }

        let stream = ReadableStream::new(Failing, QueuingStrategy::count(0.0)).unwrap();
        let first = stream.cancel("stop").await.unwrap_err();
        let second = stream.cancel("stop").await.unwrap_err();
        assert_eq!(first.reason().unwrap().to_string(), "cannot cancel");
        assert_eq!(second.reason(), first.reason());
    }

    #[tokio::test]
    async fn test_cancel_errored_stream_rejects() {
        let (stream, controller, captured) = manual_stream(1.0).await;
        controller.error("dead");
        let err = stream.cancel("late").await.unwrap_err();
        assert_eq!(err.reason().unwrap().to_string(), "dead");
        assert!(captured.cancelled.lock().unwrap().is_empty());
    }
}
