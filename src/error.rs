//! Error types for streamflow.
//!
//! Stream failures carry a [`Reason`]: the original value handed to
//! `error()`, `abort()` or `cancel()`, or returned by a failing user
//! algorithm. The same `Reason` is surfaced to every pending and future
//! operation on the failed stream.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using streamflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a user-supplied algorithm (`start`, `pull`, `write`, ...).
pub type AlgorithmResult = std::result::Result<(), Reason>;

/// Main error type for stream operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The stream is in its terminal error state.
    ///
    /// Produced by failing source/sink/transform algorithms, by `abort()`
    /// and by `error()` on a controller.
    #[error("stream errored: {0}")]
    Errored(Reason),

    /// The size algorithm failed or returned a size that is negative,
    /// NaN or infinite.
    #[error("size computation failed: {0}")]
    SizeComputation(Reason),

    /// The stream is already locked to a reader or writer.
    #[error("stream is locked")]
    LockConflict,

    /// The operation is not defined for the stream's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// The failure value carried by this error, if any.
    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Error::Errored(reason) | Error::SizeComputation(reason) => Some(reason),
            Error::LockConflict | Error::InvalidState(_) => None,
        }
    }

    /// Convert into a [`Reason`] suitable for erroring another stream.
    ///
    /// Errors that already carry a reason return it unchanged, so a failure
    /// crossing a pipe or a transform stays pointer-identical.
    pub fn into_reason(self) -> Reason {
        match self {
            Error::Errored(reason) | Error::SizeComputation(reason) => reason,
            other => Reason::from_error(other),
        }
    }

    /// Check whether this error carries exactly `reason`.
    pub fn is_reason(&self, reason: &Reason) -> bool {
        self.reason().is_some_and(|r| r == reason)
    }
}

/// An opaque, cheaply clonable failure value.
///
/// Equality is identity: two values are equal only when they are clones of
/// the same reason. Compare `to_string()` to match on the message.
#[derive(Clone)]
pub struct Reason {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl Reason {
    /// Create a reason from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Message(message.into())),
        }
    }

    /// Wrap an arbitrary error value.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Check whether both values are clones of the same reason.
    pub fn ptr_eq(&self, other: &Reason) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the wrapped error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Borrow the wrapped error.
    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reason").field(&self.inner).finish()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<&str> for Reason {
    fn from(message: &str) -> Self {
        Reason::new(message)
    }
}

impl From<String> for Reason {
    fn from(message: String) -> Self {
        Reason::new(message)
    }
}

impl From<Error> for Reason {
    fn from(err: Error) -> Self {
        err.into_reason()
    }
}
