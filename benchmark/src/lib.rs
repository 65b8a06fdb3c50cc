// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Loanbus Benchmark Fixtures
//!
//! Shared setup for the criterion benchmarks: anonymous segments sized for
//! the payloads under test and connected publisher/subscriber pairs.

use std::sync::Arc;

use loanbus_core::{
    Publisher, PublisherOptions, Segment, SegmentConfig, ServiceDescription, Subscriber,
    SubscriberOptions,
};

/// Payload sizes to benchmark (in bytes).
pub const PAYLOAD_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384, 65536];

/// Anonymous segment with one pool per entry of `PAYLOAD_SIZES`.
pub fn bench_segment(chunks_per_pool: u32) -> Arc<Segment> {
    let config = PAYLOAD_SIZES
        .iter()
        .fold(SegmentConfig::new("bench"), |config, &size| {
            config.with_pool(size as u32, chunks_per_pool)
        });
    Segment::anonymous(&config).expect("Failed to create benchmark segment")
}

pub fn bench_service() -> ServiceDescription {
    ServiceDescription::new("Bench", "Local", "Payload").expect("valid service")
}

/// A publisher with `subscribers` connected subscribers.
pub fn connected_ports(
    segment: &Arc<Segment>,
    subscribers: usize,
    options: SubscriberOptions,
) -> (Publisher, Vec<Subscriber>) {
    let subscribers: Vec<_> = (0..subscribers)
        .map(|_| {
            let subscriber = Subscriber::new(Arc::clone(segment), bench_service(), options)
                .expect("Failed to create subscriber");
            subscriber.subscribe();
            subscriber
        })
        .collect();
    let publisher = Publisher::new(
        Arc::clone(segment),
        bench_service(),
        PublisherOptions::default(),
    )
    .expect("Failed to create publisher");
    publisher.offer();
    (publisher, subscribers)
}
