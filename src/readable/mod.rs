//! Readable streams: a pull-driven source of chunks.
//!
//! A [`ReadableStream`] owns a size-accounted queue fed by its
//! [`UnderlyingSource`] through a [`ReadableStreamDefaultController`].
//! Consumers lock the stream with [`ReadableStream::get_reader`] and pull
//! chunks in order with [`ReadableStreamDefaultReader::read`].
//!
//! # Pull policy
//!
//! `pull()` is only called after `start()` has succeeded, while the stream
//! is readable and not closing, and only if a reader is waiting or the
//! queue is below the high-water mark. A second `pull()` is never issued
//! while one is outstanding; a request arriving meanwhile is remembered and
//! served once the outstanding call succeeds.

mod controller;
mod reader;
mod source;
mod tee;

pub use controller::ReadableStreamDefaultController;
pub use reader::ReadableStreamDefaultReader;
pub use source::UnderlyingSource;
pub use tee::TeeCancelReason;

pub(crate) use controller::WeakReadableController;

use crate::deferred::{Deferred, Settled};
use crate::error::{Error, Reason, Result};
use crate::queue::SizedQueue;
use crate::strategy::QueuingStrategy;
use crate::task::Spawner;
use source::{DynSource, IterSource};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Lifecycle state of a readable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    /// Chunks can still be read.
    Readable,
    /// End of stream has been reached. Terminal.
    Closed,
    /// The stream failed. Terminal.
    Errored,
}

type ReadRequest<T> = oneshot::Sender<Result<Option<T>>>;

/// State shared by a stream, its controller and its reader.
pub(crate) struct Shared<T> {
    inner: Mutex<ReadableInner<T>>,
    spawner: Spawner,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ReadableInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReadableInner<T> {
    state: ReadableState,
    stored_error: Option<Reason>,
    disturbed: bool,
    locked: bool,
    read_requests: VecDeque<ReadRequest<T>>,
    /// Chunks sent to a read request that the reader has not taken yet.
    /// A requested close waits for these.
    undelivered: usize,
    closed: Deferred<()>,
    /// Outcome of the first `cancel()`, replayed to later callers.
    cancel_outcome: Option<Settled<()>>,
    queue: SizedQueue<T>,
    strategy: QueuingStrategy<T>,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    source: Option<Arc<dyn DynSource<T>>>,
}

impl<T> ReadableInner<T> {
    fn new(strategy: QueuingStrategy<T>, source: Arc<dyn DynSource<T>>) -> Self {
        Self {
            state: ReadableState::Readable,
            stored_error: None,
            disturbed: false,
            locked: false,
            read_requests: VecDeque::new(),
            undelivered: 0,
            closed: Deferred::new(),
            cancel_outcome: None,
            queue: SizedQueue::new(),
            strategy,
            close_requested: false,
            started: false,
            pulling: false,
            pull_again: false,
            source: Some(source),
        }
    }

    fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == ReadableState::Readable
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => {
                Some(self.queue.desired_size(self.strategy.high_water_mark()))
            }
        }
    }

    fn has_pending_reads(&mut self) -> bool {
        self.read_requests.retain(|request| !request.is_closed());
        !self.read_requests.is_empty()
    }

    fn should_call_pull(&mut self) -> bool {
        if !self.started || !self.can_close_or_enqueue() {
            return false;
        }
        if self.locked && self.has_pending_reads() {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    fn stored_error(&self) -> Error {
        Error::Errored(
            self.stored_error
                .clone()
                .unwrap_or_else(|| Reason::new("readable stream errored")),
        )
    }

    fn clear_algorithms(&mut self) {
        self.source = None;
    }

    fn close(&mut self) {
        debug_assert_eq!(self.state, ReadableState::Readable);
        self.state = ReadableState::Closed;
        for request in self.read_requests.drain(..) {
            let _ = request.send(Ok(None));
        }
        self.closed.resolve(());
        tracing::debug!("readable stream closed");
    }

    /// Finish a requested close once the queue is empty and no chunk is
    /// still on its way to the reader.
    fn close_if_drained(&mut self) {
        if self.close_requested
            && self.state == ReadableState::Readable
            && self.queue.is_empty()
            && self.undelivered == 0
        {
            self.clear_algorithms();
            self.close();
        }
    }

    /// Record that the reader took a chunk sent to one of its requests.
    fn chunk_taken(&mut self) {
        self.undelivered = self.undelivered.saturating_sub(1);
        self.close_if_drained();
    }

    fn error(&mut self, reason: Reason) {
        if self.state != ReadableState::Readable {
            return;
        }
        tracing::debug!(
            "readable stream errored: {}, dropping {:?}",
            reason,
            self.queue.stats()
        );
        self.queue.reset();
        self.clear_algorithms();
        self.state = ReadableState::Errored;
        self.stored_error = Some(reason.clone());
        for request in self.read_requests.drain(..) {
            let _ = request.send(Err(Error::Errored(reason.clone())));
        }
        self.closed.reject(Error::Errored(reason));
    }

    /// Hand `chunk` to the oldest live read request.
    ///
    /// Returns the chunk if no request could take it.
    fn fulfill_read_request(&mut self, mut chunk: T) -> Option<T> {
        while let Some(request) = self.read_requests.pop_front() {
            match request.send(Ok(Some(chunk))) {
                Ok(()) => {
                    self.undelivered += 1;
                    return None;
                }
                Err(Ok(Some(returned))) => chunk = returned,
                Err(_) => return None,
            }
        }
        Some(chunk)
    }

    /// Size and queue a chunk, erroring the stream if sizing fails.
    fn enqueue_sized(&mut self, chunk: T, front: bool) -> Result<()> {
        let size = match self.strategy.size_of(&chunk) {
            Ok(size) => size,
            Err(reason) => {
                self.error(reason.clone());
                return Err(Error::SizeComputation(reason));
            }
        };
        let queued = if front {
            self.queue.push_front(chunk, size)
        } else {
            self.queue.enqueue(chunk, size)
        };
        if let Err(err) = queued {
            self.error(err.clone().into_reason());
            return Err(err);
        }
        Ok(())
    }

    /// Take back a chunk delivered to a read that was abandoned.
    ///
    /// A requested close is still pending at this point, so the chunk is
    /// read before end of stream.
    fn restore_chunk(&mut self, chunk: T) {
        self.undelivered = self.undelivered.saturating_sub(1);
        if self.state != ReadableState::Readable {
            return;
        }
        if let Some(chunk) = self.fulfill_read_request(chunk) {
            let _ = self.enqueue_sized(chunk, true);
        }
    }
}

/// A readable stream of `T` chunks.
///
/// Cloning yields another handle to the same stream.
///
/// # Example
///
/// ```rust
/// use streamflow::readable::ReadableStream;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> streamflow::error::Result<()> {
/// let stream = ReadableStream::from_iter(vec![1, 2, 3])?;
/// assert_eq!(stream.collect().await?, vec![1, 2, 3]);
/// # Ok(())
/// # }
/// ```
pub struct ReadableStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream driven by `source`.
    ///
    /// Must be called inside a Tokio runtime; `source.start()` is spawned
    /// on it immediately. Fails with [`Error::InvalidState`] if the
    /// strategy's high-water mark is invalid or no runtime is running.
    pub fn new<S>(source: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSource<T>,
    {
        strategy.validate()?;
        let spawner = Spawner::current()?;
        let source: Arc<dyn DynSource<T>> = Arc::new(source);
        let shared = Arc::new(Shared {
            inner: Mutex::new(ReadableInner::new(strategy, source.clone())),
            spawner,
        });
        ReadableStreamDefaultController::new(shared.clone()).start(source);
        Ok(Self { shared })
    }

    /// Create a stream that yields the items of `iter`, then closes.
    pub fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource::new(iter.into_iter()), QueuingStrategy::default())
    }

    /// Check whether a reader currently holds the stream.
    pub fn locked(&self) -> bool {
        self.shared.lock().locked
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> ReadableState {
        self.shared.lock().state
    }

    /// Check whether the stream has ever been read from or cancelled.
    pub fn is_disturbed(&self) -> bool {
        self.shared.lock().disturbed
    }

    /// Lock the stream to a new reader.
    ///
    /// Fails with [`Error::LockConflict`] if a reader is already active.
    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader<T>> {
        ReadableStreamDefaultReader::acquire(self.shared.clone())
    }

    /// Cancel the stream, signalling loss of interest to the source.
    ///
    /// Rejects with [`Error::LockConflict`] while a reader is active; cancel
    /// through the reader instead.
    pub fn cancel(&self, reason: impl Into<Reason>) -> Settled<()> {
        if self.locked() {
            return Deferred::rejected(Error::LockConflict).settled();
        }
        self.controller().cancel_stream(reason.into())
    }

    /// Read every remaining chunk into a vector.
    pub async fn collect(&self) -> Result<Vec<T>> {
        let reader = self.get_reader()?;
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.read().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Adapt the stream into a [`futures::Stream`].
    ///
    /// The stream stays locked until the adapter is dropped or finishes.
    pub fn into_stream(self) -> Result<impl futures::Stream<Item = Result<T>> + Send + 'static> {
        let reader = self.get_reader()?;
        Ok(futures::stream::unfold(Some(reader), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        }))
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController::new(self.shared.clone())
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Split the stream into two branches that each see every chunk.
    ///
    /// The stream itself becomes locked. The upstream source is cancelled
    /// only once both branches have been cancelled.
    pub fn tee(&self) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
        tee::tee(self)
    }
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("locked", &inner.locked)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlgorithmResult;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Counter {
        next: AtomicU32,
        max: u32,
        pulls: Arc<AtomicUsize>,
    }

    impl UnderlyingSource<u32> for Counter {
        async fn pull(&self, controller: &ReadableStreamDefaultController<u32>) -> AlgorithmResult {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.max {
                controller.enqueue(n)?;
            } else {
                controller.close()?;
            }
            Ok(())
        }
    }

    fn counter(max: u32) -> (Counter, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        (
            Counter {
                next: AtomicU32::new(0),
                max,
                pulls: pulls.clone(),
            },
            pulls,
        )
    }

    #[tokio::test]
    async fn test_pull_fills_to_high_water_mark() {
        let (source, pulls) = counter(10);
        let stream = ReadableStream::new(source, QueuingStrategy::count(3.0)).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert_eq!(stream.controller().desired_size(), Some(0.0));
        assert!(!stream.is_disturbed());
    }

    /// Tracks how many `pull` calls overlap.
    #[derive(Default)]
    struct PullLog {
        started: AtomicBool,
        early_pulls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        next: AtomicU32,
    }

    struct SlowSource(Arc<PullLog>);

    impl UnderlyingSource<u32> for SlowSource {
        async fn start(&self, _controller: &ReadableStreamDefaultController<u32>) -> AlgorithmResult {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn pull(&self, controller: &ReadableStreamDefaultController<u32>) -> AlgorithmResult {
            let log = &self.0;
            if !log.started.load(Ordering::SeqCst) {
                log.early_pulls.fetch_add(1, Ordering::SeqCst);
            }
            let now = log.active.fetch_add(1, Ordering::SeqCst) + 1;
            log.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let n = log.next.fetch_add(1, Ordering::SeqCst) + 1;
            log.active.fetch_sub(1, Ordering::SeqCst);
            controller.enqueue(n)?;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_pull_at_a_time() {
        let log = Arc::new(PullLog::default());
        let strategy = QueuingStrategy::count(0.0);
        let stream = ReadableStream::new(SlowSource(log.clone()), strategy).unwrap();
        let reader = stream.get_reader().unwrap();

        let reads = futures::future::join_all((0..4).map(|_| reader.read())).await;
        let chunks: Vec<_> = reads.into_iter().map(|read| read.unwrap()).collect();

        assert_eq!(chunks, vec![Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(log.peak.load(Ordering::SeqCst), 1);
        assert_eq!(log.early_pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pull_before_start_settles() {
        struct Gated {
            gate: Arc<Notify>,
            pulls: Arc<AtomicUsize>,
        }

        impl UnderlyingSource<u32> for Gated {
            async fn start(
                &self,
                _controller: &ReadableStreamDefaultController<u32>,
            ) -> AlgorithmResult {
                self.gate.notified().await;
                Ok(())
            }

            async fn pull(
                &self,
                controller: &ReadableStreamDefaultController<u32>,
            ) -> AlgorithmResult {
                let n = self.pulls.fetch_add(1, Ordering::SeqCst) as u32;
                controller.enqueue(n)?;
                Ok(())
            }
        }

        let gate = Arc::new(Notify::new());
        let pulls = Arc::new(AtomicUsize::new(0));
        let source = Gated {
            gate: gate.clone(),
            pulls: pulls.clone(),
        };
        let stream = ReadableStream::new(source, QueuingStrategy::count(1.0)).unwrap();
        let reader = stream.get_reader().unwrap();

        let read = reader.read();
        futures::pin_mut!(read);
        assert!(futures::poll!(read.as_mut()).is_pending());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        gate.notify_one();
        assert_eq!(read.await.unwrap(), Some(0));
        assert!(pulls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_read_drains_then_ends() {
        let (source, _) = counter(5);
        let stream = ReadableStream::new(source, QueuingStrategy::count(1.0)).unwrap();
        let reader = stream.get_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(n) = reader.read().await.unwrap() {
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.state(), ReadableState::Closed);
        assert!(reader.read().await.unwrap().is_none());
        assert!(stream.is_disturbed());
    }

    #[tokio::test]
    async fn test_invalid_high_water_mark_rejected() {
        let (source, _) = counter(1);
        let err = ReadableStream::new(source, QueuingStrategy::count(-1.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_construction_requires_runtime() {
        let err = ReadableStream::from_iter(vec![1u8]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_rejected_while_locked() {
        let stream = ReadableStream::from_iter(vec![1u8, 2]).unwrap();
        let reader = stream.get_reader().unwrap();
        assert!(matches!(stream.cancel("stop").await, Err(Error::LockConflict)));
        reader.release_lock();
        assert!(stream.cancel("stop").await.is_ok());
        assert_eq!(stream.state(), ReadableState::Closed);
    }

    #[tokio::test]
    async fn test_into_stream_adapter() {
        use futures::StreamExt;

        let stream = ReadableStream::from_iter(vec!["a", "b"]).unwrap();
        let handle = stream.clone();
        let items: Vec<_> = stream.into_stream().unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(*items[1].as_ref().unwrap(), "b");
        assert!(!handle.locked());
    }
}
