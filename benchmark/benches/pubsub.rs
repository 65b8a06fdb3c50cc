// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Publish/take benchmarks.
//!
//! Measures the zero-copy path end to end: loan, write, publish to N
//! subscribers, take and release.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loanbus_benchmark::{bench_segment, connected_ports, PAYLOAD_SIZES};
use loanbus_core::SubscriberOptions;

/// Benchmark a publish + take round trip at various payload sizes.
fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_roundtrip");
    group.measurement_time(Duration::from_secs(5));
    let segment = bench_segment(32);
    let (publisher, subscribers) = connected_ports(&segment, 1, SubscriberOptions::default());
    let subscriber = &subscribers[0];

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                publisher
                    .publish_result_of(size, 8, |payload| payload.fill(0xAB))
                    .expect("publish");
                let sample = subscriber.take().expect("take").expect("sample");
                black_box(sample[0]);
            });
        });
    }

    group.finish();
}

/// Benchmark fan-out cost as subscribers are added.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_fanout");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 4, 16] {
        let segment = bench_segment(64);
        let (publisher, subscribers_ports) =
            connected_ports(&segment, subscribers, SubscriberOptions::default());

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    let report = publisher.publish_copy_of(&42u64).expect("publish");
                    black_box(report.delivered);
                    for subscriber in &subscribers_ports {
                        drop(subscriber.take().expect("take"));
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_roundtrip, bench_fanout);
criterion_main!(benches);
