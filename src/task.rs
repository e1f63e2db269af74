//! Runtime handle captured by every stream at construction.
//!
//! User algorithms run as Tokio tasks on the runtime the stream was created
//! in, so controller methods may be called from any thread.

use crate::error::{Error, Result};
use std::future::Future;
use tokio::runtime::Handle;

/// Spawner bound to the runtime current at construction time.
#[derive(Clone, Debug)]
pub(crate) struct Spawner {
    handle: Handle,
}

impl Spawner {
    /// Capture the current runtime.
    pub(crate) fn current() -> Result<Self> {
        Handle::try_current()
            .map(|handle| Self { handle })
            .map_err(|_| Error::InvalidState("streams must be created inside a Tokio runtime"))
    }

    /// Run `future` as a detached task.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        drop(self.handle.spawn(future));
    }
}
