//! Transform streams: a writable side and a readable side joined by a
//! [`Transformer`].
//!
//! Chunks written to [`TransformStream::writable`] are passed to
//! `transform()`, whose output appears on [`TransformStream::readable`].
//!
//! # Backpressure
//!
//! The two sides share one flag. It is raised when enqueueing leaves the
//! readable side with no room (it would not pull), and lowered when the
//! readable side pulls. While raised, the next `transform()` waits, which
//! holds the pending write and in turn the writable side's `ready()`.
//! Only one `transform()` runs at a time; there is no separate limit on
//! transforms in flight.

mod controller;
mod transformer;

pub use controller::TransformStreamDefaultController;
pub use transformer::{IdentityTransformer, Transformer};

use crate::deferred::{Deferred, Settled};
use crate::error::{AlgorithmResult, Error, Reason, Result};
use crate::readable::{
    ReadableStream, ReadableStreamDefaultController, UnderlyingSource, WeakReadableController,
};
use crate::strategy::{defaults, QueuingStrategy};
use crate::task::Spawner;
use crate::writable::{
    UnderlyingSink, WeakWritableController, WritableStream, WritableStreamDefaultController,
};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use transformer::DynTransformer;

/// Reason the writable side fails with after
/// [`TransformStreamDefaultController::terminate`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("transform stream terminated")]
pub struct TransformTerminated;

/// Operations the transform controller needs from the writable half.
pub(crate) trait TransformLink: Send + Sync {
    fn apply_backpressure(&self);
    fn error_writable_and_unblock_write(&self, reason: Reason);
}

struct LinkState<I, O> {
    transformer: Option<Arc<dyn DynTransformer<I, O>>>,
    backpressure: bool,
    /// Settled and replaced whenever `backpressure` is set.
    changed: Deferred<()>,
}

struct TransformShared<I, O> {
    state: Mutex<LinkState<I, O>>,
    readable: OnceLock<WeakReadableController<O>>,
    writable: OnceLock<WeakWritableController<I>>,
    started: Deferred<()>,
}

impl<I, O> TransformShared<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, LinkState<I, O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn readable(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.readable.get().and_then(WeakReadableController::upgrade)
    }

    fn writable(&self) -> Option<WritableStreamDefaultController<I>> {
        self.writable.get().and_then(WeakWritableController::upgrade)
    }

    fn controller(self: &Arc<Self>) -> Option<TransformStreamDefaultController<O>> {
        let link: Arc<dyn TransformLink> = self.clone();
        self.readable()
            .map(|readable| TransformStreamDefaultController::new(readable, link))
    }

    /// Set the flag, wake everyone waiting for a change, and return a handle
    /// for the next change.
    fn set_backpressure(&self, backpressure: bool) -> Settled<()> {
        let mut state = self.lock();
        state.backpressure = backpressure;
        let previous = std::mem::replace(&mut state.changed, Deferred::new());
        previous.resolve(());
        state.changed.settled()
    }

    fn error(&self, reason: Reason) {
        if let Some(readable) = self.readable() {
            readable.error(reason.clone());
        }
        self.error_writable_and_unblock_write(reason);
    }

    async fn wait_started(&self) -> AlgorithmResult {
        self.started.settled().await.map_err(Error::into_reason)
    }

    async fn perform_transform(self: &Arc<Self>, chunk: I) -> AlgorithmResult {
        let transformer = self.lock().transformer.clone();
        let (Some(transformer), Some(controller)) = (transformer, self.controller()) else {
            return Err(Reason::new("transform stream is no longer running"));
        };
        match transformer.transform(chunk, &controller).await {
            Ok(()) => Ok(()),
            Err(reason) => {
                tracing::debug!("transform failed: {}", reason);
                self.error(reason.clone());
                Err(reason)
            }
        }
    }
}

impl<I, O> TransformLink for TransformShared<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn apply_backpressure(&self) {
        if !self.lock().backpressure {
            self.set_backpressure(true);
        }
    }

    fn error_writable_and_unblock_write(&self, reason: Reason) {
        self.lock().transformer = None;
        if let Some(writable) = self.writable() {
            writable.error(reason);
        }
        // Also releases a pull parked on the change signal.
        self.set_backpressure(false);
    }
}

struct TransformSink<I, O> {
    shared: Arc<TransformShared<I, O>>,
}

impl<I, O> UnderlyingSink<I> for TransformSink<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn start(&self, _controller: &WritableStreamDefaultController<I>) -> AlgorithmResult {
        self.shared.wait_started().await
    }

    async fn write(
        &self,
        chunk: I,
        controller: &WritableStreamDefaultController<I>,
    ) -> AlgorithmResult {
        let blocked = {
            let state = self.shared.lock();
            state.backpressure.then(|| state.changed.settled())
        };
        if let Some(changed) = blocked {
            let _ = changed.await;
            if let Some(reason) = controller.erroring_reason() {
                return Err(reason);
            }
        }
        self.shared.perform_transform(chunk).await
    }

    async fn close(&self) -> AlgorithmResult {
        let transformer = self.shared.lock().transformer.take();
        let outcome = match (transformer, self.shared.controller()) {
            (Some(transformer), Some(controller)) => transformer.flush(&controller).await,
            _ => Ok(()),
        };
        if let Err(reason) = outcome {
            tracing::debug!("transform flush failed: {}", reason);
            self.shared.error(reason.clone());
            return Err(reason);
        }
        if let Some(readable) = self.shared.readable() {
            if let Some(reason) = readable.errored_reason() {
                return Err(reason);
            }
            if readable.can_close_or_enqueue() {
                let _ = readable.close();
            }
        }
        Ok(())
    }

    async fn abort(&self, reason: Reason) -> AlgorithmResult {
        self.shared.error(reason);
        Ok(())
    }
}

struct TransformSource<I, O> {
    shared: Arc<TransformShared<I, O>>,
}

impl<I, O> UnderlyingSource<O> for TransformSource<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn start(&self, _controller: &ReadableStreamDefaultController<O>) -> AlgorithmResult {
        self.shared.wait_started().await
    }

    async fn pull(&self, _controller: &ReadableStreamDefaultController<O>) -> AlgorithmResult {
        let changed = self.shared.set_backpressure(false);
        let _ = changed.await;
        Ok(())
    }

    async fn cancel(&self, reason: Reason) -> AlgorithmResult {
        self.shared.error_writable_and_unblock_write(reason);
        Ok(())
    }
}

/// A writable side of `I` chunks feeding a readable side of `O` chunks.
///
/// # Example
///
/// ```rust
/// use streamflow::error::AlgorithmResult;
/// use streamflow::transform::{TransformStream, TransformStreamDefaultController, Transformer};
///
/// struct Double;
///
/// impl Transformer<u32, u32> for Double {
///     async fn transform(
///         &self,
///         n: u32,
///         c: &TransformStreamDefaultController<u32>,
///     ) -> AlgorithmResult {
///         c.enqueue(n * 2)?;
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> streamflow::error::Result<()> {
/// let transform = TransformStream::from_transformer(Double)?;
/// let writer = transform.writable().get_writer()?;
/// let readable = transform.readable().clone();
/// let output = tokio::spawn(async move { readable.collect().await });
/// writer.write(21);
/// writer.close().await?;
/// assert_eq!(output.await.unwrap()?, vec![42]);
/// # Ok(())
/// # }
/// ```
pub struct TransformStream<I, O> {
    writable: WritableStream<I>,
    readable: ReadableStream<O>,
}

impl<I, O> TransformStream<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a transform with explicit strategies for both sides.
    pub fn new<X>(
        transformer: X,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self>
    where
        X: Transformer<I, O>,
    {
        writable_strategy.validate()?;
        readable_strategy.validate()?;
        let spawner = Spawner::current()?;

        let transformer: Arc<dyn DynTransformer<I, O>> = Arc::new(transformer);
        let shared = Arc::new(TransformShared {
            state: Mutex::new(LinkState {
                transformer: Some(transformer.clone()),
                backpressure: false,
                changed: Deferred::new(),
            }),
            readable: OnceLock::new(),
            writable: OnceLock::new(),
            started: Deferred::new(),
        });
        shared.set_backpressure(true);

        let writable = WritableStream::new(
            TransformSink {
                shared: shared.clone(),
            },
            writable_strategy,
        )?;
        let readable = ReadableStream::new(
            TransformSource {
                shared: shared.clone(),
            },
            readable_strategy,
        )?;
        let _ = shared.writable.set(writable.controller().downgrade());
        let _ = shared.readable.set(readable.controller().downgrade());

        let starting = shared.clone();
        spawner.spawn(async move {
            let outcome = match starting.controller() {
                Some(controller) => transformer.start(&controller).await,
                None => Ok(()),
            };
            starting.started.settle(outcome.map_err(Error::Errored));
        });

        Ok(Self { writable, readable })
    }

    /// Create a transform with the default strategies: the writable side
    /// buffers one chunk and the readable side none.
    pub fn from_transformer<X>(transformer: X) -> Result<Self>
    where
        X: Transformer<I, O>,
    {
        Self::new(
            transformer,
            QueuingStrategy::count(defaults::TRANSFORM_WRITABLE_HIGH_WATER_MARK),
            QueuingStrategy::count(defaults::TRANSFORM_READABLE_HIGH_WATER_MARK),
        )
    }

    /// The input side.
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// The output side.
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Split into the input and output sides.
    pub fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

impl<T: Send + 'static> TransformStream<T, T> {
    /// A transform that forwards chunks unchanged.
    pub fn identity() -> Result<Self> {
        Self::from_transformer(IdentityTransformer)
    }
}

impl<I, O> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            writable: self.writable.clone(),
            readable: self.readable.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStream")
            .field("writable", &self.writable)
            .field("readable", &self.readable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableState;
    use crate::writable::WritableState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Double;

    impl Transformer<u32, u32> for Double {
        async fn transform(
            &self,
            n: u32,
            c: &TransformStreamDefaultController<u32>,
        ) -> AlgorithmResult {
            c.enqueue(n * 2)?;
            Ok(())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Transformer<u32, u32> for Counting {
        async fn transform(
            &self,
            n: u32,
            c: &TransformStreamDefaultController<u32>,
        ) -> AlgorithmResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            c.enqueue(n)?;
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_identity_forwards() {
        let transform = TransformStream::<&str, &str>::identity().unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let readable = transform.readable().clone();
        let output = tokio::spawn(async move { readable.collect().await });
        writer.write("a");
        writer.write("b");
        writer.close().await.unwrap();
        assert_eq!(output.await.unwrap().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_backpressure_holds_transform_until_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let transform = TransformStream::from_transformer(Counting(calls.clone())).unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();

        let first = writer.write(1);
        let second = writer.write(2);
        settle().await;
        // readable high-water mark is zero, so nothing runs until a read
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(first.peek().is_none());
        assert!(writer.ready().peek().is_none());

        assert_eq!(reader.read().await.unwrap(), Some(1));
        first.await.unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.peek().is_none());

        assert_eq!(reader.read().await.unwrap(), Some(2));
        second.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_readable_buffer_lets_transform_run_ahead() {
        let calls = Arc::new(AtomicUsize::new(0));
        let transform = TransformStream::new(
            Counting(calls.clone()),
            QueuingStrategy::count(1.0),
            QueuingStrategy::count(2.0),
        )
        .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        for n in 0..4 {
            writer.write(n);
        }
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(transform.readable().controller().desired_size(), Some(0.0));
    }

    #[tokio::test]
    async fn test_transform_failure_errors_both_sides() {
        struct Picky;
        impl Transformer<i32, i32> for Picky {
            async fn transform(
                &self,
                n: i32,
                c: &TransformStreamDefaultController<i32>,
            ) -> AlgorithmResult {
                if n < 0 {
                    return Err(Reason::new("negative input"));
                }
                c.enqueue(n)?;
                Ok(())
            }
        }

        let transform = TransformStream::from_transformer(Picky).unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();
        let write = writer.write(-1);
        let read = reader.read().await;
        let reason = read.unwrap_err().into_reason();
        assert_eq!(reason.to_string(), "negative input");
        assert_eq!(write.await.unwrap_err().reason(), Some(&reason));
        assert_eq!(transform.writable().state(), WritableState::Errored);
        assert_eq!(transform.readable().state(), ReadableState::Errored);
    }

    #[tokio::test]
    async fn test_flush_emits_trailer() {
        struct Framed;
        impl Transformer<String, String> for Framed {
            async fn start(&self, c: &TransformStreamDefaultController<String>) -> AlgorithmResult {
                c.enqueue("begin".to_string())?;
                Ok(())
            }
            async fn transform(
                &self,
                s: String,
                c: &TransformStreamDefaultController<String>,
            ) -> AlgorithmResult {
                c.enqueue(s.to_uppercase())?;
                Ok(())
            }
            async fn flush(&self, c: &TransformStreamDefaultController<String>) -> AlgorithmResult {
                c.enqueue("end".to_string())?;
                Ok(())
            }
        }

        let transform = TransformStream::from_transformer(Framed).unwrap();
        let readable = transform.readable().clone();
        let output = tokio::spawn(async move { readable.collect().await });
        let writer = transform.writable().get_writer().unwrap();
        writer.write("body".to_string());
        writer.close().await.unwrap();
        assert_eq!(output.await.unwrap().unwrap(), vec!["begin", "BODY", "end"]);
    }

    #[tokio::test]
    async fn test_terminate_closes_readable_errors_writable() {
        struct StopAfterFirst;
        impl Transformer<u8, u8> for StopAfterFirst {
            async fn transform(
                &self,
                n: u8,
                c: &TransformStreamDefaultController<u8>,
            ) -> AlgorithmResult {
                c.enqueue(n)?;
                c.terminate();
                Ok(())
            }
        }

        let transform = TransformStream::from_transformer(StopAfterFirst).unwrap();
        let readable = transform.readable().clone();
        let output = tokio::spawn(async move { readable.collect().await });
        let writer = transform.writable().get_writer().unwrap();
        writer.write(1).await.unwrap();
        let err = writer.write(2).await.unwrap_err();
        assert!(err.reason().unwrap().downcast_ref::<TransformTerminated>().is_some());
        assert_eq!(output.await.unwrap().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_readable_errors_writable() {
        let transform = TransformStream::<u8, u8>::identity().unwrap();
        transform.readable().cancel("consumer gone").await.unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let err = writer.write(1).await.unwrap_err();
        assert_eq!(err.reason().unwrap().to_string(), "consumer gone");
    }

    #[tokio::test]
    async fn test_start_failure_errors_both_sides() {
        struct Broken;
        impl Transformer<u8, u8> for Broken {
            async fn start(&self, _c: &TransformStreamDefaultController<u8>) -> AlgorithmResult {
                Err(Reason::new("no start"))
            }
            async fn transform(
                &self,
                _n: u8,
                _c: &TransformStreamDefaultController<u8>,
            ) -> AlgorithmResult {
                Ok(())
            }
        }

        let transform = TransformStream::from_transformer(Broken).unwrap();
        let reader = transform.readable().get_reader().unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.reason().unwrap().to_string(), "no start");
        let writer = transform.writable().get_writer().unwrap();
        assert!(writer.closed().await.is_err());
    }
}
