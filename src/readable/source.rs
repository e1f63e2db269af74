//! Underlying source algorithms.

use super::ReadableStreamDefaultController;
use crate::error::{AlgorithmResult, Reason};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Mutex;

/// The algorithm set behind a [`ReadableStream`](super::ReadableStream).
///
/// - `start()` runs once when the stream is constructed; no `pull()` is
///   issued until it settles.
/// - `pull()` is called whenever the stream wants more data. At most one
///   call is outstanding at a time.
/// - `cancel()` is called when the consumer gives up on the stream. It may
///   run while a `pull()` is still outstanding.
///
/// Returning `Err(reason)` from `start` or `pull` errors the stream with
/// `reason`.
///
/// # Example
///
/// ```rust,ignore
/// struct Counter {
///     next: AtomicU32,
///     max: u32,
/// }
///
/// impl UnderlyingSource<u32> for Counter {
///     async fn pull(&self, controller: &ReadableStreamDefaultController<u32>) -> AlgorithmResult {
///         let n = self.next.fetch_add(1, Ordering::Relaxed);
///         if n < self.max {
///             controller.enqueue(n).map_err(Reason::from)
///         } else {
///             controller.close().map_err(Reason::from)
///         }
///     }
/// }
/// ```
pub trait UnderlyingSource<T: Send + 'static>: Send + Sync + 'static {
    /// Set up the source.
    fn start(
        &self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    /// Produce more data, typically by calling `controller.enqueue()`.
    fn pull(
        &self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    /// Release the source because the consumer cancelled.
    fn cancel(&self, reason: Reason) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = reason;
        async { Ok(()) }
    }
}

/// Object-safe view of an [`UnderlyingSource`].
pub(crate) trait DynSource<T>: Send + Sync {
    fn start<'a>(
        &'a self,
        controller: &'a ReadableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn pull<'a>(
        &'a self,
        controller: &'a ReadableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn cancel(&self, reason: Reason) -> BoxFuture<'_, AlgorithmResult>;
}

impl<T, S> DynSource<T> for S
where
    T: Send + 'static,
    S: UnderlyingSource<T>,
{
    fn start<'a>(
        &'a self,
        controller: &'a ReadableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(UnderlyingSource::start(self, controller))
    }

    fn pull<'a>(
        &'a self,
        controller: &'a ReadableStreamDefaultController<T>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(UnderlyingSource::pull(self, controller))
    }

    fn cancel(&self, reason: Reason) -> BoxFuture<'_, AlgorithmResult> {
        Box::pin(UnderlyingSource::cancel(self, reason))
    }
}

/// Source that drains an iterator, one chunk per pull.
pub(crate) struct IterSource<I> {
    iter: Mutex<Option<I>>,
}

impl<I> IterSource<I> {
    pub(crate) fn new(iter: I) -> Self {
        Self {
            iter: Mutex::new(Some(iter)),
        }
    }

    fn next_item(&self) -> Option<I::Item>
    where
        I: Iterator,
    {
        let mut iter = self.iter.lock().unwrap_or_else(|e| e.into_inner());
        let item = iter.as_mut().and_then(Iterator::next);
        if item.is_none() {
            *iter = None;
        }
        item
    }
}

impl<T, I> UnderlyingSource<T> for IterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    fn pull(
        &self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let outcome = match self.next_item() {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        };
        async move { outcome.map_err(Reason::from) }
    }

    fn cancel(&self, reason: Reason) -> impl Future<Output = AlgorithmResult> + Send {
        tracing::trace!("iterator source cancelled: {}", reason);
        *self.iter.lock().unwrap_or_else(|e| e.into_inner()) = None;
        async { Ok(()) }
    }
}
