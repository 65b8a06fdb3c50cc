// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Subscriber facade: take published chunks from the receive queue and
//! read them in place.

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::table::{PortState, SubscriberSlot};
use crate::config::{PortLimits, MAX_BLOCK_TIMEOUT_MS};
use crate::error::{LoanbusResult, PortError, TakeError};
use crate::mempool::{ChunkMetadata, ChunkRef, SharedChunk, FLAG_CHECKSUM};
use crate::queue::QueueOptions;
use crate::shm::Segment;
use crate::types::{PortId, PortKind, ProcessId, ServiceDescription};

/// Subscriber parameters, fixed when the port is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberOptions {
    pub queue: QueueOptions,
    /// Samples that may be held at once.
    pub max_chunks_held: u32,
    /// History entries wanted from each publisher on connect.
    pub history_request: u32,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            max_chunks_held: 16,
            history_request: 0,
        }
    }
}

impl SubscriberOptions {
    pub fn validate(&self, limits: &PortLimits) -> Result<(), PortError> {
        let capacity = self.queue.capacity;
        if capacity == 0 || capacity > limits.max_queue_capacity {
            return Err(PortError::InvalidOption {
                field: "subscriber.queue_capacity",
                value: capacity as u64,
                reason: format!(
                    "Must be between 1 and max_queue_capacity ({})",
                    limits.max_queue_capacity
                ),
            });
        }
        if self.max_chunks_held == 0 || self.max_chunks_held > limits.max_chunks_held {
            return Err(PortError::InvalidOption {
                field: "subscriber.max_chunks_held",
                value: self.max_chunks_held as u64,
                reason: format!(
                    "Must be between 1 and max_chunks_held ({})",
                    limits.max_chunks_held
                ),
            });
        }
        if self.history_request > limits.max_history {
            return Err(PortError::InvalidOption {
                field: "subscriber.history_request",
                value: self.history_request as u64,
                reason: format!("Must be at most max_history ({})", limits.max_history),
            });
        }
        let timeout_ms = self.queue.block_timeout.as_millis();
        if timeout_ms > MAX_BLOCK_TIMEOUT_MS as u128 {
            return Err(PortError::InvalidOption {
                field: "subscriber.block_timeout_ms",
                value: timeout_ms as u64,
                reason: format!("Must be at most {} ms", MAX_BLOCK_TIMEOUT_MS),
            });
        }
        Ok(())
    }
}

/// A received chunk, readable until dropped.
pub struct Sample<'s> {
    subscriber: &'s Subscriber,
    chunk: ManuallyDrop<SharedChunk>,
}

impl Sample<'_> {
    pub fn chunk_ref(&self) -> ChunkRef {
        self.chunk.chunk_ref()
    }

    pub fn metadata(&self) -> ChunkMetadata {
        self.chunk.metadata()
    }

    /// `None` if the publisher did not stamp a checksum.
    pub fn verify_checksum(&self) -> Option<bool> {
        let header = self.chunk.header();
        if header.flags.load(Ordering::Acquire) & FLAG_CHECKSUM == 0 {
            return None;
        }
        let expected = header.checksum.load(Ordering::Acquire);
        Some(crc32fast::hash(self.chunk.payload()) == expected)
    }

    /// Copy the payload out as `T`. `None` if the length does not match.
    pub fn read_copy<T: Copy>(&self) -> Option<T> {
        let payload = self.chunk.payload();
        if payload.len() != std::mem::size_of::<T>() {
            return None;
        }
        // SAFETY: length checked; read_unaligned tolerates any alignment
        Some(unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const T) })
    }
}

impl Deref for Sample<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.chunk.payload()
    }
}

impl Drop for Sample<'_> {
    fn drop(&mut self) {
        self.subscriber.slot().ledger.untrack(self.chunk.chunk_ref());
        // SAFETY: drop runs once and the chunk is not used afterwards
        drop(unsafe { ManuallyDrop::take(&mut self.chunk) });
    }
}

/// Receiving port for one service.
pub struct Subscriber {
    segment: Arc<Segment>,
    index: u32,
    generation: u32,
    service: ServiceDescription,
    options: SubscriberOptions,
}

impl Subscriber {
    /// Claim a subscriber slot in `segment`. Starts unsubscribed.
    pub fn new(
        segment: Arc<Segment>,
        service: ServiceDescription,
        options: SubscriberOptions,
    ) -> LoanbusResult<Self> {
        options.validate(segment.limits())?;
        let (index, generation) = segment.ports().claim_subscriber(
            segment.memory(),
            ProcessId::current(),
            &service,
            &options,
        )?;

        Ok(Self {
            segment,
            index,
            generation,
            service,
            options,
        })
    }

    pub fn id(&self) -> PortId {
        PortId {
            kind: PortKind::Subscriber,
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn slot(&self) -> SubscriberSlot<'_> {
        self.segment.ports().subscriber_slot(self.index)
    }

    /// Become visible to matching publishers.
    pub fn subscribe(&self) {
        let ports = self.segment.ports();
        if self
            .slot()
            .header
            .transition(self.generation, PortState::Idle, PortState::Active)
        {
            ports.bump_epoch();
            tracing::debug!(port = %self.id(), service = %self.service, "subscribed");
        }
    }

    /// Stop receiving new chunks. Queued chunks can still be taken.
    pub fn unsubscribe(&self) {
        let ports = self.segment.ports();
        if self
            .slot()
            .header
            .transition(self.generation, PortState::Active, PortState::Idle)
        {
            ports.bump_epoch();
            tracing::debug!(port = %self.id(), service = %self.service, "unsubscribed");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.slot().header.is(self.generation, PortState::Active)
    }

    /// Take the oldest queued chunk.
    ///
    /// `Ok(None)` when the queue is empty. Fails without touching the queue
    /// when `max_chunks_held` samples are already held.
    pub fn take(&self) -> Result<Option<Sample<'_>>, TakeError> {
        let slot = self.slot();
        slot.ledger.reserve()?;
        match slot.queue.pop(&self.segment) {
            Some(chunk) => {
                slot.ledger.insert_reserved(chunk.chunk_ref());
                Ok(Some(Sample {
                    subscriber: self,
                    chunk: ManuallyDrop::new(chunk),
                }))
            }
            None => {
                slot.ledger.cancel_reservation();
                Ok(None)
            }
        }
    }

    /// Hand a sample back. Same as dropping it.
    pub fn release(&self, sample: Sample<'_>) {
        drop(sample);
    }

    pub fn has_data(&self) -> bool {
        !self.slot().queue.is_empty()
    }

    /// Block until a chunk is queued or `timeout` passes.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        self.slot().queue.wait_for_data(timeout)
    }

    /// Async form of `wait_for_data`, run on the blocking pool.
    pub async fn wait_for_data_async(&self, timeout: Duration) -> bool {
        if self.has_data() {
            return true;
        }
        let segment = Arc::clone(&self.segment);
        let index = self.index;
        tokio::task::spawn_blocking(move || {
            segment
                .ports()
                .subscriber_slot(index)
                .queue
                .wait_for_data(timeout)
        })
        .await
        .unwrap_or(false)
    }

    /// Chunks dropped from this queue by the discard-oldest policy.
    pub fn missed_chunks(&self) -> u64 {
        self.slot().queue.discarded()
    }

    /// Samples currently held.
    pub fn held_chunks(&self) -> usize {
        self.slot().ledger.len()
    }

    pub fn queue_len(&self) -> usize {
        self.slot().queue.len()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.segment
            .ports()
            .reclaim_subscriber(self.segment.memory(), self.index, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::port::{Publisher, PublisherOptions};
    use crate::queue::OverflowPolicy;

    fn segment() -> Arc<Segment> {
        let config = SegmentConfig::new("subscriber-test").with_pool(64, 32);
        Segment::anonymous(&config).unwrap()
    }

    fn service() -> ServiceDescription {
        ServiceDescription::new("Camera", "Rear", "Frame").unwrap()
    }

    fn options(capacity: u32, policy: OverflowPolicy) -> SubscriberOptions {
        SubscriberOptions {
            queue: QueueOptions {
                capacity,
                overflow_policy: policy,
                block_timeout: Duration::from_millis(10),
            },
            ..SubscriberOptions::default()
        }
    }

    #[test]
    fn test_take_from_empty_queue() {
        let subscriber =
            Subscriber::new(segment(), service(), SubscriberOptions::default()).unwrap();
        subscriber.subscribe();
        assert!(subscriber.take().unwrap().is_none());
        assert_eq!(subscriber.held_chunks(), 0);
    }

    #[test]
    fn test_unsubscribed_receives_nothing() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions::default(),
        )
        .unwrap();
        publisher.offer();
        assert_eq!(publisher.publish_copy_of(&5u16).unwrap().delivered, 0);
        assert!(!subscriber.has_data());
    }

    #[test]
    fn test_other_service_not_connected() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let other = ServiceDescription::new("Camera", "Front", "Frame").unwrap();
        let subscriber =
            Subscriber::new(Arc::clone(&segment), other, SubscriberOptions::default()).unwrap();
        subscriber.subscribe();
        publisher.offer();
        publisher.publish_copy_of(&5u16).unwrap();
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(!subscriber.has_data());
    }

    #[test]
    fn test_held_limit() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions {
                max_chunks_held: 2,
                ..SubscriberOptions::default()
            },
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();
        for value in 0..3u32 {
            publisher.publish_copy_of(&value).unwrap();
        }

        let a = subscriber.take().unwrap().unwrap();
        let b = subscriber.take().unwrap().unwrap();
        assert_eq!(
            subscriber.take().err(),
            Some(TakeError::LedgerFull { capacity: 2 })
        );
        assert_eq!(subscriber.queue_len(), 1);

        subscriber.release(a);
        drop(b);
        let c = subscriber.take().unwrap().unwrap();
        assert_eq!(c.read_copy::<u32>(), Some(2));
    }

    #[test]
    fn test_discard_oldest_counts_missed() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            options(2, OverflowPolicy::DiscardOldest),
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();
        for value in 0..5u32 {
            publisher.publish_copy_of(&value).unwrap();
        }

        assert_eq!(subscriber.missed_chunks(), 3);
        let values: Vec<u32> = std::iter::from_fn(|| {
            subscriber
                .take()
                .unwrap()
                .and_then(|sample| sample.read_copy::<u32>())
        })
        .collect();
        assert_eq!(values, vec![3, 4]);
    }

    #[test]
    fn test_reject_policy_reports_rejection() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            options(1, OverflowPolicy::Reject),
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();

        assert_eq!(publisher.publish_copy_of(&1u8).unwrap().delivered, 1);
        let report = publisher.publish_copy_of(&2u8).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(subscriber.take().unwrap().unwrap().read_copy::<u8>(), Some(1));
    }

    #[test]
    fn test_drop_releases_queued_chunks() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions::default(),
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();
        for value in 0..4u32 {
            publisher.publish_copy_of(&value).unwrap();
        }
        // The newest chunk is queued and also held in publisher history.
        assert_eq!(segment.memory().used_chunks(), 4);

        drop(subscriber);
        assert_eq!(segment.memory().used_chunks(), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_invalid_options() {
        let result = Subscriber::new(segment(), service(), options(0, OverflowPolicy::Reject));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_data_async() {
        let segment = segment();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions::default(),
        )
        .unwrap();
        subscriber.subscribe();
        assert!(!subscriber.wait_for_data_async(Duration::from_millis(10)).await);

        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        publisher.offer();
        publisher.publish_copy_of(&9u64).unwrap();
        assert!(subscriber.wait_for_data_async(Duration::from_millis(10)).await);
    }
}
