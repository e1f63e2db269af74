//! Abort signals: one-shot cancellation tokens that carry a reason.
//!
//! A pipe can be stopped from outside through [`PipeOptions::signal`], and
//! a sink can watch [`WritableStreamDefaultController::signal`] to notice
//! that its stream was aborted while a write is still running.
//!
//! [`PipeOptions::signal`]: crate::pipe::PipeOptions::signal
//! [`WritableStreamDefaultController::signal`]: crate::writable::WritableStreamDefaultController::signal

use crate::error::{Reason, Result};
use crate::task::Spawner;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reason carried by a signal created with [`AbortSignal::timeout`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("signal timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Reason used when a signal fires without one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation aborted")]
pub struct AbortError;

/// The sending half: fires its [`AbortSignal`] once.
#[derive(Clone, Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Create a controller with a fresh, unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the signal observed by the operations this controller stops.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Only the first call's reason is kept.
    pub fn abort(&self, reason: impl Into<Reason>) {
        let _ = self.signal.inner.reason.set(reason.into());
        self.signal.inner.token.cancel();
    }
}

/// The observing half of an [`AbortController`].
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<Reason>,
}

impl AbortSignal {
    /// Create a signal that fires with a [`TimeoutError`] after `duration`.
    ///
    /// Must be called inside a Tokio runtime with the timer enabled.
    pub fn timeout(duration: Duration) -> Result<Self> {
        let spawner = Spawner::current()?;
        let controller = AbortController::new();
        let signal = controller.signal();
        spawner.spawn(async move {
            tokio::time::sleep(duration).await;
            controller.abort(Reason::from_error(TimeoutError(duration)));
        });
        Ok(signal)
    }

    /// Check whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason the signal fired with, if it has.
    pub fn reason(&self) -> Option<Reason> {
        if self.is_aborted() {
            self.inner.reason.get().cloned()
        } else {
            None
        }
    }

    /// Wait until the signal fires, returning its reason.
    pub async fn aborted(&self) -> Reason {
        self.inner.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| Reason::from_error(AbortError))
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}
