//! Piping a readable stream into a writable stream.
//!
//! The pipe holds both locks for its whole run. It waits for the
//! destination to be ready, reads one chunk, submits it, and repeats. The
//! first terminal event decides how the pipe shuts down:
//!
//! | event                       | action (unless prevented)           | result          |
//! |-----------------------------|-------------------------------------|-----------------|
//! | source ends                 | close destination                   | `Ok(())`        |
//! | source errors with `e`      | abort destination with `e`          | `Err(e)`        |
//! | destination errors with `e` | cancel source with `e`              | `Err(e)`        |
//! | destination closes early    | cancel source                       | `InvalidState`  |
//! | signal fires with `r`       | abort destination and cancel source | `Err(r)`        |
//!
//! If the shutdown action itself fails, the pipe fails with that error
//! instead. While the destination is still writable, chunks already
//! submitted are allowed to finish before the action runs.

use crate::deferred::Settled;
use crate::error::{Error, Reason, Result};
use crate::readable::{ReadableState, ReadableStream, ReadableStreamDefaultReader};
use crate::signal::AbortSignal;
use crate::task::Spawner;
use crate::transform::TransformStream;
use crate::writable::{WritableState, WritableStream, WritableStreamDefaultWriter};
use futures::future::BoxFuture;

/// Shutdown options for [`ReadableStream::pipe_to`].
///
/// # Example
///
/// ```rust
/// use streamflow::pipe::PipeOptions;
/// use streamflow::signal::AbortController;
///
/// let controller = AbortController::new();
/// let options = PipeOptions::new()
///     .with_prevent_close(true)
///     .with_signal(controller.signal());
/// assert!(options.prevent_close);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    /// Leave the destination open when the source ends.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Stops the pipe when fired.
    pub signal: Option<AbortSignal>,
}

impl PipeOptions {
    /// Options with every shutdown action enabled and no signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the destination stays open when the source ends.
    pub fn with_prevent_close(mut self, prevent: bool) -> Self {
        self.prevent_close = prevent;
        self
    }

    /// Set whether the destination is left alone when the source errors.
    pub fn with_prevent_abort(mut self, prevent: bool) -> Self {
        self.prevent_abort = prevent;
        self
    }

    /// Set whether the source is left alone when the destination fails.
    pub fn with_prevent_cancel(mut self, prevent: bool) -> Self {
        self.prevent_cancel = prevent;
        self
    }

    /// Stop the pipe when `signal` fires.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Why the pipe stopped.
#[derive(Debug)]
enum Shutdown {
    SourceClosed,
    SourceErrored(Reason),
    DestErrored(Reason),
    DestClosed,
    Aborted(Reason),
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe every chunk of this stream into `dest`.
    ///
    /// Both streams are locked before this returns; if either is already
    /// locked the returned future fails with [`Error::LockConflict`] and
    /// neither stream is touched. The locks are released once the pipe has
    /// shut down.
    pub fn pipe_to(
        &self,
        dest: &WritableStream<T>,
        options: PipeOptions,
    ) -> BoxFuture<'static, Result<()>> {
        let reader = match self.get_reader() {
            Ok(reader) => reader,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        Box::pin(run_pipe(reader, writer, options))
    }

    /// Pipe this stream through `transform` in the background and return
    /// the transform's readable side.
    ///
    /// Fails with [`Error::LockConflict`] if this stream or the transform's
    /// writable side is locked. A failure of the background pipe surfaces
    /// on the returned stream and is logged.
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: PipeOptions,
    ) -> Result<ReadableStream<O>> {
        if self.locked() || transform.writable().locked() {
            return Err(Error::LockConflict);
        }
        let spawner = Spawner::current()?;
        let pipe = self.pipe_to(transform.writable(), options);
        spawner.spawn(async move {
            if let Err(err) = pipe.await {
                tracing::warn!("pipe through transform failed: {}", err);
            }
        });
        Ok(transform.readable().clone())
    }
}

async fn run_pipe<T: Send + 'static>(
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    options: PipeOptions,
) -> Result<()> {
    let mut last_write: Option<Settled<()>> = None;
    let source_closed = reader.closed();
    let dest_closed = writer.closed();

    let shutdown = tokio::select! {
        biased;
        reason = aborted(options.signal.as_ref()) => Shutdown::Aborted(reason),
        shutdown = pump(&reader, &writer, &mut last_write) => shutdown,
        outcome = source_closed.wait() => match outcome {
            Ok(()) => Shutdown::SourceClosed,
            Err(err) => Shutdown::SourceErrored(err.into_reason()),
        },
        outcome = dest_closed.wait() => match outcome {
            Ok(()) => Shutdown::DestClosed,
            Err(err) => Shutdown::DestErrored(err.into_reason()),
        },
    };
    tracing::debug!("pipe shutting down: {:?}", shutdown);

    let outcome = match shutdown {
        Shutdown::SourceClosed if options.prevent_close => Ok(()),
        Shutdown::SourceClosed => {
            finish_writes(&writer, last_write).await;
            writer.close_with_error_propagation().await
        }
        Shutdown::SourceErrored(reason) => {
            if !options.prevent_abort {
                finish_writes(&writer, last_write).await;
                writer.abort(reason.clone()).await?;
            }
            Err(Error::Errored(reason))
        }
        Shutdown::DestErrored(reason) => {
            if !options.prevent_cancel {
                reader.cancel(reason.clone()).await?;
            }
            Err(Error::Errored(reason))
        }
        Shutdown::DestClosed => {
            let err = Error::InvalidState("destination closed before the pipe finished");
            if !options.prevent_cancel {
                reader.cancel(err.clone().into_reason()).await?;
            }
            Err(err)
        }
        Shutdown::Aborted(reason) => {
            finish_writes(&writer, last_write).await;
            let abort = (!options.prevent_abort && writer.state() == WritableState::Writable)
                .then(|| writer.abort(reason.clone()));
            let cancel = (!options.prevent_cancel && reader.state() == ReadableState::Readable)
                .then(|| reader.cancel(reason.clone()));
            if let Some(abort) = abort {
                abort.await?;
            }
            if let Some(cancel) = cancel {
                cancel.await?;
            }
            Err(Error::Errored(reason))
        }
    };

    drop(reader);
    drop(writer);
    outcome
}

/// Move chunks until something terminal happens.
async fn pump<T: Send + 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
    last_write: &mut Option<Settled<()>>,
) -> Shutdown {
    loop {
        if let Err(err) = writer.ready().await {
            return Shutdown::DestErrored(err.into_reason());
        }
        let chunk = match reader.read().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Shutdown::SourceClosed,
            Err(err) => return Shutdown::SourceErrored(err.into_reason()),
        };
        let write = writer.write(chunk);
        match write.peek() {
            Some(Err(Error::InvalidState(_))) => return Shutdown::DestClosed,
            Some(Err(err)) => return Shutdown::DestErrored(err.into_reason()),
            _ => *last_write = Some(write),
        }
    }
}

/// Wait for submitted chunks to be written while the destination still
/// accepts them.
async fn finish_writes<T: Send + 'static>(
    writer: &WritableStreamDefaultWriter<T>,
    last_write: Option<Settled<()>>,
) {
    if writer.state() != WritableState::Writable {
        return;
    }
    if let Some(write) = last_write {
        let _ = write.await;
    }
}

async fn aborted(signal: Option<&AbortSignal>) -> Reason {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlgorithmResult;
    use crate::signal::AbortController;
    use crate::strategy::QueuingStrategy;
    use crate::writable::{UnderlyingSink, WritableStreamDefaultController};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collect {
        chunks: Mutex<Vec<u32>>,
        events: Mutex<Vec<String>>,
    }

    struct CollectSink(Arc<Collect>);

    impl UnderlyingSink<u32> for CollectSink {
        async fn write(
            &self,
            chunk: u32,
            _controller: &WritableStreamDefaultController<u32>,
        ) -> AlgorithmResult {
            tokio::task::yield_now().await;
            self.0.chunks.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(&self) -> AlgorithmResult {
            self.0.events.lock().unwrap().push("close".into());
            Ok(())
        }

        async fn abort(&self, reason: Reason) -> AlgorithmResult {
            self.0.events.lock().unwrap().push(format!("abort: {reason}"));
            Ok(())
        }
    }

    fn sink() -> (WritableStream<u32>, Arc<Collect>) {
        let log = Arc::new(Collect::default());
        let strategy = QueuingStrategy::count(2.0);
        let stream = WritableStream::new(CollectSink(log.clone()), strategy).unwrap();
        (stream, log)
    }

    #[tokio::test]
    async fn test_pipe_preserves_order_and_closes() {
        let source = ReadableStream::from_iter(vec![1, 2, 3]).unwrap();
        let (dest, log) = sink();
        source.pipe_to(&dest, PipeOptions::default()).await.unwrap();
        assert_eq!(*log.chunks.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*log.events.lock().unwrap(), vec!["close".to_string()]);
        assert!(!source.locked());
        assert!(!dest.locked());
        assert_eq!(dest.state(), WritableState::Closed);
    }

    #[tokio::test]
    async fn test_prevent_close_leaves_destination_open() {
        let source = ReadableStream::from_iter(vec![1]).unwrap();
        let (dest, log) = sink();
        let options = PipeOptions::new().with_prevent_close(true);
        source.pipe_to(&dest, options).await.unwrap();
        assert_eq!(dest.state(), WritableState::Writable);
        assert!(log.events.lock().unwrap().is_empty());
        assert_eq!(*log.chunks.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_locked_stream_rejected_without_side_effects() {
        let source = ReadableStream::from_iter(vec![1]).unwrap();
        let (dest, _log) = sink();
        let writer = dest.get_writer().unwrap();
        let err = source.pipe_to(&dest, PipeOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::LockConflict));
        assert!(!source.locked());
        assert!(!source.is_disturbed());
        drop(writer);
    }

    #[tokio::test]
    async fn test_signal_stops_pipe() {
        let controller = AbortController::new();
        controller.abort("user stop");
        let source = ReadableStream::from_iter(1..).unwrap();
        let (dest, log) = sink();
        let options = PipeOptions::new().with_signal(controller.signal());
        let err = source.pipe_to(&dest, options).await.unwrap_err();
        assert_eq!(err.reason().unwrap().to_string(), "user stop");
        assert_eq!(source.state(), ReadableState::Closed);
        assert_eq!(dest.state(), WritableState::Errored);
        assert_eq!(*log.events.lock().unwrap(), vec!["abort: user stop".to_string()]);
    }
}
