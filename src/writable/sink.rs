//! Underlying sink algorithms.

use super::WritableStreamDefaultController;
use crate::error::{AlgorithmResult, Reason};
use futures::future::BoxFuture;
use std::future::Future;

/// The algorithm set behind a [`WritableStream`](super::WritableStream).
///
/// `write()` is called for one chunk at a time, in submission order, and
/// never before `start()` has succeeded. `close()` runs after every queued
/// write has completed. `abort()` runs when the stream is aborted, after
/// any write already in progress has settled.
pub trait UnderlyingSink<T: Send + 'static>: Send + Sync + 'static {
    /// Set up the sink.
    fn start(
        &self,
        controller: &WritableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    /// Consume one chunk.
    fn write(
        &self,
        chunk: T,
        controller: &WritableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send;

    /// Finish after all writes succeeded.
    fn close(&self) -> impl Future<Output = AlgorithmResult> + Send {
        async { Ok(()) }
    }

    /// Tear down after the stream was aborted.
    fn abort(&self, reason: Reason) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = reason;
        async { Ok(()) }
    }
}

/// Object-safe view of an [`UnderlyingSink`].
pub(crate) trait DynSink<T>: Send + Sync {
    fn start<'a>(
        &'a self,
        controller: &'a WritableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn write<'a>(
        &'a self,
        chunk: T,
        controller: &'a WritableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn close(&self) -> BoxFuture<'_, AlgorithmResult>;

    fn abort(&self, reason: Reason) -> BoxFuture<'_, AlgorithmResult>;
}

impl<T, S> DynSink<T> for S
where
    T: Send + 'static,
    S: UnderlyingSink<T>,
{
    fn start<'a>(
        &'a self,
        controller: &'a WritableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(UnderlyingSink::start(self, controller))
    }

    fn write<'a>(
        &'a self,
        chunk: T,
        controller: &'a WritableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(UnderlyingSink::write(self, chunk, controller))
    }

    fn close(&self) -> BoxFuture<'_, AlgorithmResult> {
        Box::pin(UnderlyingSink::close(self))
    }

    fn abort(&self, reason: Reason) -> BoxFuture<'_, AlgorithmResult> {
        Box::pin(UnderlyingSink::abort(self, reason))
    }
}
