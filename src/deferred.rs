//! Deferred results shared between a stream and its callers.
//!
//! A [`Deferred`] is settled at most once, by whoever resolves or rejects it
//! first. Any number of [`Settled`] observers can await the outcome, before
//! or after settlement.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::future::IntoFuture;
use tokio::sync::watch;

type Slot<V> = Option<Result<V>>;

/// A single-assignment result slot.
pub struct Deferred<V = ()> {
    tx: watch::Sender<Slot<V>>,
}

impl<V> Deferred<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an unsettled deferred.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Create a deferred that is already resolved with `value`.
    pub fn resolved(value: V) -> Self {
        let (tx, _rx) = watch::channel(Some(Ok(value)));
        Self { tx }
    }

    /// Create a deferred that is already rejected with `err`.
    pub fn rejected(err: Error) -> Self {
        let (tx, _rx) = watch::channel(Some(Err(err)));
        Self { tx }
    }

    /// Resolve with `value`. Returns `false` if already settled.
    pub fn resolve(&self, value: V) -> bool {
        self.settle(Ok(value))
    }

    /// Reject with `err`. Returns `false` if already settled.
    pub fn reject(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    /// Settle with an outcome. First settlement wins.
    pub fn settle(&self, outcome: Result<V>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// Check whether the deferred has been settled.
    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Check whether the deferred has been settled with an error.
    pub fn is_rejected(&self) -> bool {
        matches!(*self.tx.borrow(), Some(Err(_)))
    }

    /// Copy the outcome, if settled.
    pub fn peek(&self) -> Option<Result<V>> {
        self.tx.borrow().clone()
    }

    /// Get an awaitable observer of the outcome.
    pub fn settled(&self) -> Settled<V> {
        Settled {
            rx: self.tx.subscribe(),
        }
    }
}

impl<V> Default for Deferred<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Deferred<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.tx.borrow() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

/// Awaitable observer of a [`Deferred`].
///
/// Dropping it has no effect on the deferred. If the deferred itself is
/// dropped without being settled, waiting fails with
/// [`Error::InvalidState`].
pub struct Settled<V = ()> {
    rx: watch::Receiver<Slot<V>>,
}

impl<V> Settled<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Wait for the outcome.
    pub async fn wait(mut self) -> Result<V> {
        let outcome = match self.rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(Error::InvalidState(
            "deferred result dropped before settling",
        )))
    }

    /// Copy the outcome without waiting, if settled.
    pub fn peek(&self) -> Option<Result<V>> {
        self.rx.borrow().clone()
    }
}

impl<V> Clone for Settled<V> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<V> IntoFuture for Settled<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Output = Result<V>;
    type IntoFuture = BoxFuture<'static, Result<V>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<V> std::fmt::Debug for Settled<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settled")
            .field("settled", &self.rx.borrow().is_some())
            .finish()
    }
}
