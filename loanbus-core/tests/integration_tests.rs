// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for loanbus.
//!
//! These tests drive segments, ports and the reaper together the way two
//! cooperating processes would, using anonymous mappings unless a test is
//! specifically about named segments.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use loanbus_core::{
    AllocationError, ConfigLoader, OverflowPolicy, PortReaper, ProcessId, PublisherOptions,
    Publisher, QueueOptions, Segment, SegmentConfig, ServiceDescription, Subscriber,
    SubscriberOptions,
};

fn service() -> ServiceDescription {
    ServiceDescription::new("Radar", "FrontLeft", "Object").expect("valid service")
}

fn segment(pools: &[(u32, u32)]) -> Arc<Segment> {
    let config = pools
        .iter()
        .fold(SegmentConfig::new("integration"), |config, &(size, count)| {
            config.with_pool(size, count)
        });
    Segment::anonymous(&config).expect("Failed to create segment")
}

fn assert_conserved(segment: &Segment) {
    for pool in segment.memory().pools() {
        assert_eq!(
            pool.free_list_len() + pool.used(),
            pool.chunk_count() as u64,
            "pool {} leaked or double-freed",
            pool.chunk_size()
        );
    }
}

fn subscriber_options(capacity: u32, policy: OverflowPolicy, timeout: Duration) -> SubscriberOptions {
    SubscriberOptions {
        queue: QueueOptions {
            capacity,
            overflow_policy: policy,
            block_timeout: timeout,
        },
        ..SubscriberOptions::default()
    }
}

fn drain_u32(subscriber: &Subscriber) -> Vec<u32> {
    std::iter::from_fn(|| {
        subscriber
            .take()
            .expect("take failed")
            .and_then(|sample| sample.read_copy::<u32>())
    })
    .collect()
}

// =========================================================================
// Chunk pool
// =========================================================================

#[test]
fn test_conservation_across_mixed_operations() {
    let segment = segment(&[(64, 16), (1024, 4)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(4, OverflowPolicy::DiscardOldest, Duration::ZERO),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();

    for value in 0..20u32 {
        publisher.publish_copy_of(&value).expect("publish failed");
        assert_conserved(&segment);
        if value % 3 == 0 {
            drop(subscriber.take().expect("take failed"));
        }
        assert_conserved(&segment);
    }
    let big = publisher.loan(900, 8).expect("loan from large class");
    assert_eq!(big.metadata().chunk_size, 1024);
    assert_conserved(&segment);
    drop(big);

    drop(subscriber);
    drop(publisher);
    assert_conserved(&segment);
    assert_eq!(segment.memory().used_chunks(), 0);
}

#[test]
fn test_concurrent_clone_drop_frees_once() {
    let segment = segment(&[(64, 4)]);
    let chunk = segment.allocate(16, 8).expect("allocate");
    let clones: Vec<_> = (0..8).map(|_| chunk.clone()).collect();
    drop(chunk);

    let handles: Vec<_> = clones
        .into_iter()
        .map(|clone| thread::spawn(move || drop(clone)))
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(segment.memory().used_chunks(), 0);
    assert_conserved(&segment);
}

#[test]
fn test_exhaustion_then_recovery() {
    let segment = segment(&[(64, 3)]);
    let mut chunks: Vec<_> = (0..3)
        .map(|_| segment.allocate(8, 8).expect("allocate"))
        .collect();
    assert_eq!(
        segment.allocate(8, 8).expect_err("pool should be exhausted"),
        AllocationError::PoolExhausted { size: 8 }
    );

    drop(chunks.pop());
    let refill = segment.allocate(8, 8).expect("one release frees one chunk");
    assert!(segment.allocate(8, 8).is_err());
    assert_eq!(segment.memory().used_chunks(), 3);

    drop(refill);
    drop(chunks);
    assert_conserved(&segment);
}

#[test]
fn test_alignment_falls_through_to_larger_class() {
    let segment = segment(&[(64, 2), (1024, 2)]);
    let chunk = segment.allocate(8, 256).expect("allocate aligned");
    assert_eq!(chunk.metadata().chunk_size, 1024);
    assert_eq!(chunk.payload().as_ptr() as usize % 256, 0);
}

// =========================================================================
// Publish / subscribe
// =========================================================================

#[test]
fn test_fifo_between_threads_with_block_policy() {
    let segment = segment(&[(64, 16)]);
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(4, OverflowPolicy::Block, Duration::from_secs(5)),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();

    let producer_segment = Arc::clone(&segment);
    let producer = thread::spawn(move || {
        let publisher =
            Publisher::new(producer_segment, service(), PublisherOptions::default())
                .expect("Failed to create publisher");
        publisher.offer();
        for value in 0..200u32 {
            let report = publisher.publish_copy_of(&value).expect("publish failed");
            assert_eq!(report.delivered, 1);
        }
    });

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 200 && Instant::now() < deadline {
        subscriber.wait_for_data(Duration::from_millis(50));
        received.extend(drain_u32(&subscriber));
    }
    producer.join().expect("producer panicked");

    assert_eq!(received, (0..200).collect::<Vec<_>>());
}

#[test]
fn test_discard_oldest_keeps_newest() {
    let segment = segment(&[(64, 8)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(2, OverflowPolicy::DiscardOldest, Duration::ZERO),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();

    for value in [10u32, 11, 12] {
        publisher.publish_copy_of(&value).expect("publish failed");
    }
    assert_eq!(drain_u32(&subscriber), vec![11, 12]);
    assert_eq!(subscriber.missed_chunks(), 1);
}

#[test]
fn test_reject_keeps_oldest() {
    let segment = segment(&[(64, 8)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(2, OverflowPolicy::Reject, Duration::ZERO),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();

    let reports: Vec<_> = [10u32, 11, 12]
        .iter()
        .map(|value| publisher.publish_copy_of(value).expect("publish failed"))
        .collect();
    assert_eq!(reports[2].rejected, 1);
    assert_eq!(drain_u32(&subscriber), vec![10, 11]);
    assert_conserved(&segment);
}

#[test]
fn test_block_policy_times_out_and_slow_subscriber_does_not_starve_others() {
    let segment = segment(&[(64, 16)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let slow = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(1, OverflowPolicy::Block, Duration::from_millis(30)),
    )
    .expect("Failed to create slow subscriber");
    let fast = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(8, OverflowPolicy::DiscardOldest, Duration::ZERO),
    )
    .expect("Failed to create fast subscriber");
    slow.subscribe();
    fast.subscribe();
    publisher.offer();

    assert_eq!(publisher.publish_copy_of(&1u32).expect("publish").delivered, 2);

    let start = Instant::now();
    let report = publisher.publish_copy_of(&2u32).expect("publish");
    assert!(start.elapsed() >= Duration::from_millis(25));
    assert_eq!(report.delivered, 1);
    assert_eq!(report.timed_out, 1);

    assert_eq!(drain_u32(&fast), vec![1, 2]);
    assert_eq!(drain_u32(&slow), vec![1]);
}

#[test]
fn test_blocked_publish_does_not_strand_chunk_in_disconnected_subscriber() {
    let segment = segment(&[(64, 16)]);
    let publisher = Publisher::new(
        Arc::clone(&segment),
        service(),
        PublisherOptions {
            history_capacity: 0,
            ..PublisherOptions::default()
        },
    )
    .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        subscriber_options(2, OverflowPolicy::Block, Duration::from_secs(5)),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();
    publisher.publish_copy_of(&1u32).expect("publish");
    publisher.publish_copy_of(&2u32).expect("publish");

    let start = Instant::now();
    let report = thread::scope(|scope| {
        let blocked = scope.spawn(|| publisher.publish_copy_of(&3u32).expect("publish"));
        thread::sleep(Duration::from_millis(50));
        drop(subscriber);
        blocked.join().expect("publisher thread panicked")
    });

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(report.delivered, 0);
    assert_eq!(segment.memory().used_chunks(), 0);
    assert_eq!(publisher.subscriber_count(), 0);
    let claimed = segment.ports().claimed_ports();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, publisher.id());
    assert_conserved(&segment);
}

#[test]
fn test_late_subscriber_receives_history() {
    let segment = segment(&[(64, 16)]);
    let publisher = Publisher::new(
        Arc::clone(&segment),
        service(),
        PublisherOptions {
            history_capacity: 3,
            ..PublisherOptions::default()
        },
    )
    .expect("Failed to create publisher");
    publisher.offer();
    for value in 0..5u32 {
        publisher.publish_copy_of(&value).expect("publish failed");
    }

    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        SubscriberOptions {
            history_request: 2,
            ..SubscriberOptions::default()
        },
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();

    publisher.publish_copy_of(&5u32).expect("publish failed");
    assert_eq!(drain_u32(&subscriber), vec![3, 4, 5]);
}

#[test]
fn test_stop_offer_stops_delivery() {
    let segment = segment(&[(64, 8)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        SubscriberOptions::default(),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();

    assert_eq!(publisher.publish_copy_of(&1u32).expect("publish").delivered, 1);
    publisher.stop_offer();
    assert!(!publisher.is_offered());
    assert_eq!(publisher.publish_copy_of(&2u32).expect("publish").delivered, 0);
    publisher.offer();
    assert_eq!(publisher.publish_copy_of(&3u32).expect("publish").delivered, 1);

    assert_eq!(drain_u32(&subscriber), vec![1, 3]);
}

#[test]
fn test_unsubscribe_disconnects() {
    let segment = segment(&[(64, 8)]);
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        SubscriberOptions::default(),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();
    assert_eq!(publisher.subscriber_count(), 1);

    subscriber.unsubscribe();
    assert_eq!(publisher.subscriber_count(), 0);
    assert_eq!(publisher.publish_copy_of(&1u32).expect("publish").delivered, 0);
}

// =========================================================================
// Crash recovery
// =========================================================================

#[test]
fn test_reaper_reclaims_ports_of_dead_process() {
    let segment = segment(&[(64, 16)]);
    let publisher = Publisher::new(
        Arc::clone(&segment),
        service(),
        PublisherOptions {
            max_loans: 4,
            ..PublisherOptions::default()
        },
    )
    .expect("Failed to create publisher");
    let subscriber = Subscriber::new(
        Arc::clone(&segment),
        service(),
        SubscriberOptions::default(),
    )
    .expect("Failed to create subscriber");
    subscriber.subscribe();
    publisher.offer();

    for value in 0..3u32 {
        publisher.publish_copy_of(&value).expect("publish failed");
    }
    let sample = subscriber.take().expect("take").expect("sample");
    let loans = [
        publisher.loan(8, 8).expect("loan"),
        publisher.loan(8, 8).expect("loan"),
    ];
    assert_eq!(segment.memory().used_chunks(), 5);

    // Simulate the owner dying: nothing runs its destructors.
    std::mem::forget(loans);
    std::mem::forget(sample);
    std::mem::forget(subscriber);
    std::mem::forget(publisher);

    let me = ProcessId::current();
    let reaper = PortReaper::new(Arc::clone(&segment));
    assert_eq!(reaper.reap(&|pid: ProcessId| pid != me).ports_reclaimed(), 0);

    let report = reaper.reap(&|_: ProcessId| false);
    assert_eq!(report.publishers_reclaimed, 1);
    assert_eq!(report.subscribers_reclaimed, 1);
    // Publisher: two loans and one history entry. Subscriber: one sample
    // and two queued chunks.
    assert_eq!(report.chunks_released, 6);
    assert_eq!(segment.memory().used_chunks(), 0);
    assert_conserved(&segment);
    assert!(segment.ports().claimed_ports().is_empty());

    // The slots are reusable.
    let publisher = Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default())
        .expect("slot should be free again");
    assert_eq!(publisher.id().generation, 2);
}

// =========================================================================
// Configuration and named segments
// =========================================================================

#[test]
fn test_config_file_drives_segment_and_ports() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(
        file,
        r#"
segment:
  name: loanbus-config-test
  max_subscribers: 4
pools:
  - chunk_size: 256
    chunk_count: 8
publisher:
  history_capacity: 2
subscriber:
  queue_capacity: 4
  overflow_policy: reject
  history_request: 2
"#
    )
    .expect("Failed to write config");

    let config = ConfigLoader::load_file(file.path()).expect("config should load");
    let segment = Segment::anonymous(&config.segment).expect("Failed to create segment");
    assert_eq!(segment.limits().max_subscribers, 4);

    let publisher = Publisher::new(Arc::clone(&segment), service(), config.publisher)
        .expect("Failed to create publisher");
    let subscriber = Subscriber::new(Arc::clone(&segment), service(), config.subscriber)
        .expect("Failed to create subscriber");
    assert_eq!(subscriber.options().queue.overflow_policy, OverflowPolicy::Reject);

    publisher.offer();
    publisher.publish_copy_of(&7u32).expect("publish failed");
    subscriber.subscribe();
    assert_eq!(publisher.subscriber_count(), 1);
    assert_eq!(drain_u32(&subscriber), vec![7]);
}

#[test]
fn test_named_segment_shared_between_handles() {
    let name = format!("loanbus-it-{}", std::process::id());
    let config = SegmentConfig::new(name.as_str()).with_pool(128, 8);
    let creator = Segment::create(&config).expect("Failed to create named segment");
    let opener = Segment::open(&name).expect("Failed to open named segment");

    let subscriber = Subscriber::new(Arc::clone(&opener), service(), SubscriberOptions::default())
        .expect("Failed to create subscriber");
    subscriber.subscribe();
    let publisher = Publisher::new(Arc::clone(&creator), service(), PublisherOptions::default())
        .expect("Failed to create publisher");
    publisher.offer();

    publisher
        .publish_result_of(5, 1, |payload| payload.copy_from_slice(b"hello"))
        .expect("publish failed");
    let sample = subscriber.take().expect("take").expect("sample");
    assert_eq!(&*sample, b"hello");
    assert_eq!(sample.metadata().origin, Some(publisher.id()));

    drop(sample);
    drop(subscriber);
    drop(publisher);
    assert_eq!(creator.stats().used_chunks(), 0);
    assert!(creator.stats().ports.is_empty());
}
