//! Sink-side handle of a writable stream and the write queue engine.

use super::sink::DynSink;
use super::{PendingAbort, Shared, WritableInner, WritableState, WriteRecord};
use crate::deferred::{Deferred, Settled};
use crate::error::{Error, Reason};
use crate::signal::AbortSignal;
use std::fmt;
use std::sync::{Arc, Weak};

/// Handle passed to an [`UnderlyingSink`](super::UnderlyingSink).
pub struct WritableStreamDefaultController<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WritableStreamDefaultController<T> {
    pub(super) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Error the stream from the sink side.
    ///
    /// Has no effect unless the stream is writable. Queued writes are
    /// rejected with `reason` once any in-flight write settles; the sink's
    /// `abort()` is not called.
    pub fn error(&self, reason: impl Into<Reason>) {
        let mut inner = self.shared.lock();
        self.error_locked(&mut inner, reason.into());
    }

    /// Signal that fires when the stream is aborted.
    pub fn signal(&self) -> AbortSignal {
        self.shared.lock().abort_controller.signal()
    }

    /// The stored error while the stream is erroring.
    pub(crate) fn erroring_reason(&self) -> Option<Reason> {
        let inner = self.shared.lock();
        match inner.state {
            WritableState::Erroring => inner.stored_error.clone(),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakWritableController<T> {
        WeakWritableController {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(super) fn start(&self, sink: Arc<dyn DynSink<T>>) {
        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            let outcome = sink.start(&controller).await;
            let mut inner = controller.shared.lock();
            inner.started = true;
            match outcome {
                Ok(()) => controller.advance_queue_if_needed(&mut inner),
                Err(reason) => controller.deal_with_rejection(&mut inner, reason),
            }
        });
    }

    /// Queue `chunk` and return a handle that settles once the sink has
    /// processed it.
    pub(super) fn write(&self, chunk: T) -> Settled<()> {
        let mut inner = self.shared.lock();
        match inner.public_state() {
            WritableState::Writable => {}
            WritableState::Closing | WritableState::Closed => {
                return Deferred::rejected(Error::InvalidState(
                    "cannot write to a stream that is closing or closed",
                ))
                .settled();
            }
            WritableState::Erroring | WritableState::Errored => {
                return Deferred::rejected(inner.stored_error()).settled();
            }
        }

        let size = match inner.strategy.size_of(&chunk) {
            Ok(size) => size,
            Err(reason) => {
                self.error_locked(&mut inner, reason.clone());
                return Deferred::rejected(Error::SizeComputation(reason)).settled();
            }
        };
        if let Err(err) = inner.queue.enqueue(WriteRecord::Chunk(Some(chunk)), size) {
            self.error_locked(&mut inner, err.clone().into_reason());
            return Deferred::rejected(err).settled();
        }

        let request = Deferred::new();
        let settled = request.settled();
        inner.write_requests.push_back(request);
        inner.update_backpressure();
        self.advance_queue_if_needed(&mut inner);
        settled
    }

    pub(super) fn close(&self) -> Settled<()> {
        let mut inner = self.shared.lock();
        match inner.public_state() {
            WritableState::Writable => {}
            WritableState::Closing => {
                return Deferred::rejected(Error::InvalidState("stream is already closing"))
                    .settled();
            }
            WritableState::Closed => {
                return Deferred::rejected(Error::InvalidState("stream is already closed"))
                    .settled();
            }
            WritableState::Erroring | WritableState::Errored => {
                return Deferred::rejected(inner.stored_error()).settled();
            }
        }

        let request = Deferred::new();
        let settled = request.settled();
        inner.close_request = Some(request);
        if inner.backpressure {
            inner.ready.resolve(());
        }
        // A zero-sized marker cannot fail to enqueue.
        let _ = inner.queue.enqueue(WriteRecord::Close, 0.0);
        self.advance_queue_if_needed(&mut inner);
        settled
    }

    /// Close unless the stream is already closing or closed.
    pub(super) fn close_with_error_propagation(&self) -> Settled<()> {
        {
            let inner = self.shared.lock();
            if inner.close_queued_or_in_flight() || inner.state == WritableState::Closed {
                return Deferred::resolved(()).settled();
            }
            if inner.state == WritableState::Errored {
                return Deferred::rejected(inner.stored_error()).settled();
            }
        }
        self.close()
    }

    pub(super) fn abort(&self, reason: Reason) -> Settled<()> {
        let mut inner = self.shared.lock();
        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            return Deferred::resolved(()).settled();
        }
        inner.abort_controller.abort(reason.clone());
        if let Some(pending) = &inner.pending_abort {
            return pending.deferred.settled();
        }

        tracing::debug!("writable stream aborted: {}", reason);
        let was_already_erroring = inner.state == WritableState::Erroring;
        let deferred = Deferred::new();
        let settled = deferred.settled();
        inner.pending_abort = Some(PendingAbort {
            deferred,
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(&mut inner, reason);
        }
        settled
    }

    fn error_locked(&self, inner: &mut WritableInner<T>, reason: Reason) {
        if inner.state != WritableState::Writable {
            return;
        }
        inner.clear_algorithms();
        self.start_erroring(inner, reason);
    }

    fn deal_with_rejection(&self, inner: &mut WritableInner<T>, reason: Reason) {
        if inner.state == WritableState::Writable {
            self.start_erroring(inner, reason);
        } else {
            self.finish_erroring(inner);
        }
    }

    fn start_erroring(&self, inner: &mut WritableInner<T>, reason: Reason) {
        debug_assert!(inner.stored_error.is_none());
        tracing::debug!("writable stream erroring: {}", reason);
        inner.state = WritableState::Erroring;
        inner.stored_error = Some(reason.clone());
        inner.reject_ready(Error::Errored(reason));
        if !inner.has_operation_in_flight() && inner.started {
            self.finish_erroring(inner);
        }
    }

    fn finish_erroring(&self, inner: &mut WritableInner<T>) {
        inner.state = WritableState::Errored;
        inner.queue.reset();
        let err = inner.stored_error();
        for request in inner.write_requests.drain(..) {
            request.reject(err.clone());
        }
        tracing::debug!("writable stream errored");

        let Some(abort) = inner.pending_abort.take() else {
            inner.reject_close_and_closed();
            return;
        };
        if abort.was_already_erroring {
            abort.deferred.reject(err);
            inner.reject_close_and_closed();
            return;
        }
        let Some(sink) = inner.sink.take() else {
            abort.deferred.resolve(());
            inner.reject_close_and_closed();
            return;
        };

        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            let outcome = sink.abort(abort.reason).await;
            abort.deferred.settle(outcome.map_err(Error::Errored));
            controller.shared.lock().reject_close_and_closed();
        });
    }

    fn advance_queue_if_needed(&self, inner: &mut WritableInner<T>) {
        if !inner.started || inner.in_flight_write.is_some() {
            return;
        }
        match inner.state {
            WritableState::Erroring => {
                if inner.in_flight_close.is_none() {
                    self.finish_erroring(inner);
                }
                return;
            }
            WritableState::Writable => {}
            _ => return,
        }
        match inner.queue.peek() {
            None => {}
            Some(WriteRecord::Close) => self.process_close(inner),
            Some(WriteRecord::Chunk(_)) => self.process_write(inner),
        }
    }

    fn process_write(&self, inner: &mut WritableInner<T>) {
        let Some(sink) = inner.sink.clone() else {
            return;
        };
        let Some(request) = inner.write_requests.pop_front() else {
            return;
        };
        let Some(chunk) = (match inner.queue.peek_mut() {
            Some(WriteRecord::Chunk(slot)) => slot.take(),
            _ => None,
        }) else {
            request.reject(Error::InvalidState("write queue out of order"));
            return;
        };
        inner.in_flight_write = Some(request);

        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            let outcome = sink.write(chunk, &controller).await;
            let mut inner = controller.shared.lock();
            let Some(request) = inner.in_flight_write.take() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    request.resolve(());
                    inner.queue.dequeue();
                    if !inner.close_queued_or_in_flight()
                        && inner.state == WritableState::Writable
                    {
                        inner.update_backpressure();
                    }
                    controller.advance_queue_if_needed(&mut inner);
                }
                Err(reason) => {
                    tracing::debug!("sink write failed: {}", reason);
                    if inner.state == WritableState::Writable {
                        inner.clear_algorithms();
                    }
                    request.reject(Error::Errored(reason.clone()));
                    controller.deal_with_rejection(&mut inner, reason);
                }
            }
        });
    }

    fn process_close(&self, inner: &mut WritableInner<T>) {
        let Some(request) = inner.close_request.take() else {
            return;
        };
        inner.in_flight_close = Some(request);
        inner.queue.dequeue();
        debug_assert!(inner.queue.is_empty());
        let sink = inner.sink.take();

        let controller = self.clone();
        self.shared.spawner.spawn(async move {
            let outcome = match &sink {
                Some(sink) => sink.close().await,
                None => Ok(()),
            };
            let mut inner = controller.shared.lock();
            let Some(request) = inner.in_flight_close.take() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    request.resolve(());
                    if inner.state == WritableState::Erroring {
                        inner.stored_error = None;
                        if let Some(abort) = inner.pending_abort.take() {
                            abort.deferred.resolve(());
                        }
                    }
                    inner.state = WritableState::Closed;
                    inner.closed.resolve(());
                    tracing::debug!("writable stream closed");
                }
                Err(reason) => {
                    request.reject(Error::Errored(reason.clone()));
                    if let Some(abort) = inner.pending_abort.take() {
                        abort.deferred.reject(Error::Errored(reason.clone()));
                    }
                    controller.deal_with_rejection(&mut inner, reason);
                }
            }
        });
    }
}

impl<T> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for WritableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("WritableStreamDefaultController")
            .field("state", &inner.public_state())
            .field("in_flight_write", &inner.in_flight_write.is_some())
            .finish()
    }
}

/// Non-owning controller reference held by objects the stream itself owns.
pub(crate) struct WeakWritableController<T> {
    shared: Weak<Shared<T>>,
}

impl<T: Send + 'static> WeakWritableController<T> {
    pub(crate) fn upgrade(&self) -> Option<WritableStreamDefaultController<T>> {
        self.shared.upgrade().map(WritableStreamDefaultController::new)
    }
}

impl<T> Clone for WeakWritableController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
