//! Transformer algorithms.

use super::TransformStreamDefaultController;
use crate::error::{AlgorithmResult, Reason};
use futures::future::BoxFuture;
use std::future::Future;

/// The algorithm set behind a [`TransformStream`](super::TransformStream).
///
/// `transform()` is called once per chunk written to the writable side, in
/// order, and may enqueue any number of output chunks. `flush()` runs once
/// after the last `transform()` when the writable side is closed.
///
/// Returning `Err(reason)` from any of them errors both sides with `reason`.
pub trait Transformer<I, O>: Send + Sync + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Set up the transformer. Neither side processes chunks until this
    /// succeeds.
    fn start(
        &self,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    /// Turn one input chunk into zero or more output chunks.
    fn transform(
        &self,
        chunk: I,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = AlgorithmResult> + Send;

    /// Emit any trailing output before the readable side closes.
    fn flush(
        &self,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let _ = controller;
        async { Ok(()) }
    }
}

pub(crate) trait DynTransformer<I, O>: Send + Sync {
    fn start<'a>(
        &'a self,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn transform<'a>(
        &'a self,
        chunk: I,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult>;

    fn flush<'a>(
        &'a self,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult>;
}

impl<I, O, X> DynTransformer<I, O> for X
where
    I: Send + 'static,
    O: Send + 'static,
    X: Transformer<I, O>,
{
    fn start<'a>(
        &'a self,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(Transformer::start(self, controller))
    }

    fn transform<'a>(
        &'a self,
        chunk: I,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(Transformer::transform(self, chunk, controller))
    }

    fn flush<'a>(
        &'a self,
        controller: &'a TransformStreamDefaultController<O>,
    ) -> BoxFuture<'a, AlgorithmResult> {
        Box::pin(Transformer::flush(self, controller))
    }
}

/// Forwards every chunk unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl<T: Send + 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(
        &self,
        chunk: T,
        controller: &TransformStreamDefaultController<T>,
    ) -> impl Future<Output = AlgorithmResult> + Send {
        let outcome = controller.enqueue(chunk).map_err(Reason::from);
        async move { outcome }
    }
}
