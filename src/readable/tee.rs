//! Splitting one readable stream into two branches.
//!
//! Both branches are fed by a single upstream reader. Each chunk read from
//! upstream is enqueued into every branch that has not been cancelled, so a
//! branch that is read more slowly simply buffers. Branch queues are not
//! bounded by the branch's high-water mark: the upstream is pulled at the
//! pace of the faster branch.

use super::{
    ReadableStream, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    UnderlyingSource, WeakReadableController,
};
use crate::deferred::Deferred;
use crate::error::{AlgorithmResult, Error, Reason, Result};
use crate::strategy::QueuingStrategy;
use crate::task::Spawner;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Reason the upstream is cancelled with once both branches are cancelled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("both tee branches cancelled ({branch1}; {branch2})")]
pub struct TeeCancelReason {
    /// Reason given when the first branch was cancelled.
    pub branch1: Reason,
    /// Reason given when the second branch was cancelled.
    pub branch2: Reason,
}

struct TeeState<T: Send + 'static> {
    reader: ReadableStreamDefaultReader<T>,
    spawner: Spawner,
    inner: Mutex<TeeInner<T>>,
    /// Settles when upstream is finished with, by end of stream, error, or
    /// the cancellation of both branches.
    cancelled: Deferred<()>,
}

struct TeeInner<T> {
    reading: bool,
    read_again: bool,
    canceled: [bool; 2],
    reasons: [Option<Reason>; 2],
    branches: [Option<WeakReadableController<T>>; 2],
}

impl<T: Clone + Send + 'static> TeeState<T> {
    fn lock(&self) -> MutexGuard<'_, TeeInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_branches(&self) -> Vec<ReadableStreamDefaultController<T>> {
        let inner = self.lock();
        (0..2)
            .filter(|&i| !inner.canceled[i])
            .filter_map(|i| inner.branches[i].as_ref().and_then(WeakReadableController::upgrade))
            .collect()
    }

    fn all_branches(&self) -> Vec<ReadableStreamDefaultController<T>> {
        let inner = self.lock();
        inner
            .branches
            .iter()
            .flatten()
            .filter_map(WeakReadableController::upgrade)
            .collect()
    }

    fn pull(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.reading {
                inner.read_again = true;
                return;
            }
            inner.reading = true;
        }

        let state = self.clone();
        self.spawner.spawn(async move {
            match state.reader.read().await {
                Ok(Some(chunk)) => {
                    state.lock().read_again = false;
                    let mut branches = state.live_branches();
                    if let Some(last) = branches.pop() {
                        for branch in &branches {
                            let _ = branch.enqueue(chunk.clone());
                        }
                        let _ = last.enqueue(chunk);
                    }
                    let again = {
                        let mut inner = state.lock();
                        inner.reading = false;
                        std::mem::take(&mut inner.read_again)
                    };
                    if again {
                        state.pull();
                    }
                }
                Ok(None) => {
                    state.lock().reading = false;
                    for branch in state.live_branches() {
                        let _ = branch.close();
                    }
                    state.cancelled.resolve(());
                }
                Err(err) => {
                    state.lock().reading = false;
                    state.fail(err.into_reason());
                }
            }
        });
    }

    fn fail(&self, reason: Reason) {
        tracing::debug!("tee upstream errored: {}", reason);
        for branch in self.all_branches() {
            branch.error(reason.clone());
        }
        self.cancelled.resolve(());
    }

    async fn cancel_branch(&self, index: usize, reason: Reason) -> AlgorithmResult {
        let composite = {
            let mut inner = self.lock();
            inner.canceled[index] = true;
            inner.reasons[index] = Some(reason);
            match &inner.reasons {
                [Some(branch1), Some(branch2)] => Some(TeeCancelReason {
                    branch1: branch1.clone(),
                    branch2: branch2.clone(),
                }),
                _ => None,
            }
        };
        if let Some(composite) = composite {
            tracing::debug!("{}", composite);
            let outcome = self.reader.cancel(Reason::from_error(composite)).await;
            self.cancelled.settle(outcome);
        }
        self.cancelled.settled().await.map_err(Error::into_reason)
    }
}

struct TeeBranch<T: Send + 'static> {
    state: Arc<TeeState<T>>,
    index: usize,
}

impl<T: Clone + Send + 'static> UnderlyingSource<T> for TeeBranch<T> {
    fn pull(
        &self,
        _controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        self.state.pull();
        async { Ok(()) }
    }

    fn cancel(&self, reason: Reason) -> impl Future<Output = AlgorithmResult> + Send {
        self.state.cancel_branch(self.index, reason)
    }
}

pub(super) fn tee<T: Clone + Send + 'static>(
    stream: &ReadableStream<T>,
) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
    let reader = stream.get_reader()?;
    let upstream_closed = reader.closed();
    let state = Arc::new(TeeState {
        reader,
        spawner: Spawner::current()?,
        inner: Mutex::new(TeeInner {
            reading: false,
            read_again: false,
            canceled: [false; 2],
            reasons: [None, None],
            branches: [None, None],
        }),
        cancelled: Deferred::new(),
    });

    let branch1 = ReadableStream::new(
        TeeBranch {
            state: state.clone(),
            index: 0,
        },
        QueuingStrategy::default(),
    )?;
    let branch2 = ReadableStream::new(
        TeeBranch {
            state: state.clone(),
            index: 1,
        },
        QueuingStrategy::default(),
    )?;
    state.lock().branches = [
        Some(branch1.controller().downgrade()),
        Some(branch2.controller().downgrade()),
    ];

    let watched: Weak<TeeState<T>> = Arc::downgrade(&state);
    state.spawner.spawn(async move {
        if let Err(err) = upstream_closed.await {
            if let Some(state) = watched.upgrade() {
                state.fail(err.into_reason());
            }
        }
    });

    Ok((branch1, branch2))
}
