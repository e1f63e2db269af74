//! Throughput benchmarks for streamflow.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use streamflow::prelude::*;
use tokio::runtime::Runtime;

/// A sink that just counts chunks.
struct BenchSink {
    count: Arc<AtomicUsize>,
}

impl UnderlyingSink<u64> for BenchSink {
    async fn write(
        &self,
        chunk: u64,
        _controller: &WritableStreamDefaultController<u64>,
    ) -> AlgorithmResult {
        black_box(chunk);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    let rt = runtime();

    for count in [100u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let stream = ReadableStream::from_iter(0..count).unwrap();
                    black_box(stream.collect().await.unwrap())
                })
            });
        });
    }

    group.finish();
}

fn bench_pipe(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_to");
    let rt = runtime();

    for hwm in [1.0, 16.0, 256.0] {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::from_parameter(hwm), &hwm, |b, &hwm| {
            b.iter(|| {
                rt.block_on(async {
                    let count = Arc::new(AtomicUsize::new(0));
                    let source = ReadableStream::from_iter(0..10_000u64).unwrap();
                    let sink = BenchSink {
                        count: count.clone(),
                    };
                    let dest = WritableStream::new(sink, QueuingStrategy::count(hwm)).unwrap();
                    source.pipe_to(&dest, PipeOptions::default()).await.unwrap();
                    assert_eq!(count.load(Ordering::Relaxed), 10_000);
                })
            });
        });
    }

    group.finish();
}

fn bench_pipe_through(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_through_identity");
    let rt = runtime();
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("10000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let source = ReadableStream::from_iter(0..10_000u64).unwrap();
                let transform = TransformStream::identity().unwrap();
                let output = source
                    .pipe_through(&transform, PipeOptions::default())
                    .unwrap();
                black_box(output.collect().await.unwrap())
            })
        });
    });

    group.finish();
}

fn bench_tee(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("tee_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let source = ReadableStream::from_iter(0..1_000u64).unwrap();
                let (left, right) = source.tee().unwrap();
                let (a, b) = tokio::join!(left.collect(), right.collect());
                black_box((a.unwrap(), b.unwrap()))
            })
        });
    });
}

criterion_group!(benches, bench_read, bench_pipe, bench_pipe_through, bench_tee);
criterion_main!(benches);
