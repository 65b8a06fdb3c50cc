// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Chunk pool microbenchmarks.
//!
//! Measures loan/release of chunks at various payload sizes, single
//! threaded and under contention.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loanbus_benchmark::{bench_segment, PAYLOAD_SIZES};

/// Benchmark one allocate + release cycle.
fn bench_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_allocate_release");
    group.measurement_time(Duration::from_secs(5));
    let segment = bench_segment(64);

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let chunk = segment.allocate(black_box(size), 8).expect("allocate");
                black_box(chunk.chunk_ref());
            });
        });
    }

    group.finish();
}

/// Benchmark clone + drop of a chunk handle (refcount traffic only).
fn bench_clone_drop(c: &mut Criterion) {
    let segment = bench_segment(4);
    let chunk = segment.allocate(64, 8).expect("allocate");

    c.bench_function("chunk_clone_drop", |b| {
        b.iter(|| drop(black_box(chunk.clone())));
    });
}

/// Benchmark allocate/release with several threads hitting one pool.
fn bench_contended_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_allocate_contended");
    group.measurement_time(Duration::from_secs(5));
    let segment = bench_segment(256);

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 1000) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let segment = Arc::clone(&segment);
                        thread::spawn(move || {
                            for _ in 0..1000 {
                                if let Ok(chunk) = segment.allocate(64, 8) {
                                    black_box(chunk.chunk_ref());
                                }
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("worker panicked");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_clone_drop,
    bench_contended_allocate
);
criterion_main!(benches);
