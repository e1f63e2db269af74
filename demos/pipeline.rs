//! Source -> transform -> sink, with a timeout guarding the pipe.
//!
//! Run with `RUST_LOG=streamflow=debug` to see state transitions.

use std::sync::Mutex;
use std::time::Duration;
use streamflow::prelude::*;
use tracing_subscriber::EnvFilter;

/// Splits text chunks into words.
struct Words;

impl Transformer<String, String> for Words {
    async fn transform(
        &self,
        chunk: String,
        controller: &TransformStreamDefaultController<String>,
    ) -> AlgorithmResult {
        for word in chunk.split_whitespace() {
            controller.enqueue(word.to_lowercase())?;
        }
        Ok(())
    }
}

/// Prints each word and keeps a tally.
#[derive(Default)]
struct Printer {
    seen: Mutex<usize>,
}

impl UnderlyingSink<String> for Printer {
    async fn write(
        &self,
        chunk: String,
        _controller: &WritableStreamDefaultController<String>,
    ) -> AlgorithmResult {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        *seen += 1;
        println!("{:>3}: {}", *seen, chunk);
        Ok(())
    }

    async fn close(&self) -> AlgorithmResult {
        println!("done");
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let lines = vec![
        "The quick brown fox".to_string(),
        "jumps over".to_string(),
        "the lazy dog".to_string(),
    ];
    let source = ReadableStream::from_iter(lines)?;
    let splitter = TransformStream::from_transformer(Words)?;
    let words = source.pipe_through(&splitter, PipeOptions::default())?;

    let sink = WritableStream::new(Printer::default(), QueuingStrategy::count(4.0))?;
    let options = PipeOptions::new().with_signal(AbortSignal::timeout(Duration::from_secs(1))?);
    words.pipe_to(&sink, options).await?;

    Ok(())
}
