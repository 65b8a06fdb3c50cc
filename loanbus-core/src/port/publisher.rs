// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Publisher facade: loan a chunk, write it in place, publish it to every
//! connected subscriber.

use std::collections::HashSet;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::table::{PortState, PublisherSlot};
use crate::config::PortLimits;
use crate::error::{AllocationError, LoanbusResult, PortError, QueueFull, QueueFullReason};
use crate::mempool::{ChunkMetadata, ChunkRef, SharedChunk, FLAG_CHECKSUM};
use crate::queue::{OverflowPolicy, PushOutcome};
use crate::shm::Segment;
use crate::types::{unix_time_ns, PortId, PortKind, ProcessId, ServiceDescription};

/// Publisher parameters, fixed when the port is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherOptions {
    /// Published chunks retained for late subscribers.
    pub history_capacity: u32,
    /// Loans that may be outstanding at once, the parked one included.
    pub max_loans: u32,
    /// Opaque user tag stamped into every published chunk.
    pub type_hint: u64,
    /// Stamp a CRC32 of the payload at publish.
    pub checksum: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            history_capacity: 1,
            max_loans: 8,
            type_hint: 0,
            checksum: false,
        }
    }
}

impl PublisherOptions {
    pub fn validate(&self, limits: &PortLimits) -> Result<(), PortError> {
        if self.history_capacity > limits.max_history {
            return Err(PortError::InvalidOption {
                field: "publisher.history_capacity",
                value: self.history_capacity as u64,
                reason: format!("Must be at most max_history ({})", limits.max_history),
            });
        }
        if self.max_loans == 0 || self.max_loans > limits.max_chunks_held {
            return Err(PortError::InvalidOption {
                field: "publisher.max_loans",
                value: self.max_loans as u64,
                reason: format!(
                    "Must be between 1 and max_chunks_held ({})",
                    limits.max_chunks_held
                ),
            });
        }
        Ok(())
    }
}

/// Outcome of one publish, aggregated over all connected subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Subscribers whose queue received the chunk.
    pub delivered: usize,
    /// Subscribers whose full queue refused the chunk.
    pub rejected: usize,
    /// Blocking subscribers that stayed full until the deadline.
    pub timed_out: usize,
    /// Older entries dropped from discard-oldest queues to make room.
    pub discarded: u64,
}

/// Anything that can publish a loan.
pub trait PublishChunk {
    fn publish_chunk(&self, loan: Loan<'_>) -> PublishReport;
}

#[derive(Debug, Clone, Copy)]
struct Connection {
    generation: u32,
}

enum Delivery {
    Sent(PushOutcome),
    Refused(QueueFull),
    Gone,
}

/// A chunk loaned from the pool, writable until published.
///
/// Dropping an unpublished loan parks it; `Publisher::loan_previous` hands
/// it out again.
pub struct Loan<'p> {
    publisher: &'p Publisher,
    chunk: ManuallyDrop<SharedChunk>,
}

impl Loan<'_> {
    pub fn payload(&self) -> &[u8] {
        self.chunk.payload()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: a loan is the only reference to an unpublished chunk
        unsafe { self.chunk.payload_mut() }
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn chunk_ref(&self) -> ChunkRef {
        self.chunk.chunk_ref()
    }

    pub fn metadata(&self) -> ChunkMetadata {
        self.chunk.metadata()
    }

    fn into_chunk(self) -> SharedChunk {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the chunk is taken exactly once
        unsafe { ManuallyDrop::take(&mut this.chunk) }
    }
}

impl Drop for Loan<'_> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and the chunk is not used afterwards
        let chunk = unsafe { ManuallyDrop::take(&mut self.chunk) };
        self.publisher.park(chunk);
    }
}

/// Publishing port for one service.
pub struct Publisher {
    segment: Arc<Segment>,
    index: u32,
    generation: u32,
    service: ServiceDescription,
    options: PublisherOptions,
    offered: AtomicBool,
    /// Connected subscriber slots by index.
    connections: DashMap<u32, Connection>,
    seen_epoch: AtomicU64,
    /// Last loan dropped without publishing.
    previous: Mutex<Option<SharedChunk>>,
    /// Serializes connection refresh and history updates.
    history_lock: Mutex<()>,
}

impl Publisher {
    /// Claim a publisher slot in `segment`. Starts in the stopped-offer state.
    pub fn new(
        segment: Arc<Segment>,
        service: ServiceDescription,
        options: PublisherOptions,
    ) -> LoanbusResult<Self> {
        options.validate(segment.limits())?;
        let (index, generation) = segment.ports().claim_publisher(
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
            offered: AtomicBool::new(false),
            connections: DashMap::new(),
            seen_epoch: AtomicU64::new(u64::MAX),
            previous: Mutex::new(None),
            history_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> PortId {
        PortId {
            kind: PortKind::Publisher,
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn slot(&self) -> PublisherSlot<'_> {
        self.segment.ports().publisher_slot(self.index)
    }

    pub fn is_offered(&self) -> bool {
        self.offered.load(Ordering::Acquire)
    }

    /// Start delivering to matching subscribers.
    pub fn offer(&self) {
        if self
            .slot()
            .header
            .transition(self.generation, PortState::Idle, PortState::Active)
        {
            self.offered.store(true, Ordering::Release);
            tracing::debug!(port = %self.id(), service = %self.service, "offered");
        }
        self.refresh_connections(true);
    }

    /// Stop delivering. Chunks already queued stay with their subscribers.
    pub fn stop_offer(&self) {
        if self
            .slot()
            .header
            .transition(self.generation, PortState::Active, PortState::Idle)
        {
            tracing::debug!(port = %self.id(), service = %self.service, "stopped offer");
        }
        self.offered.store(false, Ordering::Release);
        self.connections.clear();
    }

    /// Connected subscribers, after picking up topology changes.
    pub fn subscriber_count(&self) -> usize {
        if self.is_offered() {
            self.refresh_connections(false);
        }
        self.connections.len()
    }

    /// Loans currently outstanding, the parked one included.
    pub fn outstanding_loans(&self) -> usize {
        self.slot().ledger.len()
    }

    /// Retained history entries.
    pub fn history_len(&self) -> usize {
        self.slot().history_len()
    }

    /// Loan a chunk for `size` bytes aligned to `alignment`.
    pub fn loan(&self, size: usize, alignment: usize) -> Result<Loan<'_>, AllocationError> {
        let chunk = self.segment.allocate(size, alignment)?;
        let ledger = self.slot().ledger;
        if ledger.track(&chunk).is_err() {
            // The parked loan occupies a slot; give it up before failing.
            if let Some(parked) = self.take_previous() {
                ledger.untrack(parked.chunk_ref());
                drop(parked);
            }
            ledger.track(&chunk).map_err(|_| AllocationError::TooManyLoans {
                limit: self.options.max_loans as usize,
            })?;
        }
        Ok(Loan {
            publisher: self,
            chunk: ManuallyDrop::new(chunk),
        })
    }

    /// The most recent loan that was dropped without being published.
    pub fn loan_previous(&self) -> Option<Loan<'_>> {
        self.take_previous().map(|chunk| Loan {
            publisher: self,
            chunk: ManuallyDrop::new(chunk),
        })
    }

    fn take_previous(&self) -> Option<SharedChunk> {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn park(&self, chunk: SharedChunk) {
        let replaced = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(chunk);
        if let Some(old) = replaced {
            self.slot().ledger.untrack(old.chunk_ref());
        }
    }

    /// Deliver a loan to every connected subscriber and keep it in history.
    pub fn publish(&self, loan: Loan<'_>) -> PublishReport {
        if !std::ptr::eq(loan.publisher, self) {
            return loan.publisher.publish(loan);
        }

        let chunk = loan.into_chunk();
        let slot = self.slot();
        self.stamp(&chunk, &slot);

        let mut report = PublishReport::default();
        if self.is_offered() {
            self.refresh_connections(false);
            self.deliver(&chunk, &mut report);
        }

        {
            let _guard = self.history_lock.lock().unwrap_or_else(PoisonError::into_inner);
            slot.push_history(chunk.clone());
        }

        slot.ledger.untrack(chunk.chunk_ref());
        drop(chunk);

        if report.rejected > 0 || report.timed_out > 0 {
            tracing::warn!(
                port = %self.id(),
                delivered = report.delivered,
                rejected = report.rejected,
                timed_out = report.timed_out,
                "publish did not reach every subscriber"
            );
        }
        report
    }

    /// Loan, copy `value` in, publish.
    pub fn publish_copy_of<T: Copy>(&self, value: &T) -> Result<PublishReport, AllocationError> {
        let size = std::mem::size_of::<T>();
        let mut loan = self.loan(size, std::mem::align_of::<T>())?;
        // SAFETY: the payload is `size` bytes aligned for T and T is Copy
        unsafe {
            std::ptr::copy_nonoverlapping(
                value as *const T as *const u8,
                loan.payload_mut().as_mut_ptr(),
                size,
            );
        }
        Ok(self.publish(loan))
    }

    /// Loan `size` bytes, let `write` fill them, publish.
    pub fn publish_result_of<F>(
        &self,
        size: usize,
        alignment: usize,
        write: F,
    ) -> Result<PublishReport, AllocationError>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut loan = self.loan(size, alignment)?;
        write(loan.payload_mut());
        Ok(self.publish(loan))
    }

    fn stamp(&self, chunk: &SharedChunk, slot: &PublisherSlot<'_>) {
        let header = chunk.header();
        header
            .sequence
            .store(slot.header.next_sequence(), Ordering::Release);
        header.timestamp_ns.store(unix_time_ns(), Ordering::Release);
        header
            .origin_port
            .store(self.id().to_bits(), Ordering::Release);
        header
            .type_hint
            .store(self.options.type_hint, Ordering::Release);
        if self.options.checksum {
            header
                .checksum
                .store(crc32fast::hash(chunk.payload()), Ordering::Release);
            header.flags.fetch_or(FLAG_CHECKSUM, Ordering::AcqRel);
        }
    }

    /// Re-scan subscriber slots if the topology changed since the last scan.
    fn refresh_connections(&self, force: bool) {
        let ports = self.segment.ports();
        let epoch = ports.epoch();
        if !force && epoch == self.seen_epoch.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.history_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut live = HashSet::new();
        for index in 0..ports.max_subscribers() {
            let slot = ports.subscriber_slot(index);
            if slot.header.state() != PortState::Active || !slot.header.matches(&self.service) {
                continue;
            }
            let generation = slot.header.generation();
            live.insert(index);

            let known = self
                .connections
                .get(&index)
                .is_some_and(|connection| connection.generation == generation);
            if !known {
                self.connections.insert(index, Connection { generation });
                tracing::debug!(port = %self.id(), subscriber = index, "connected subscriber");
                self.deliver_history(index, generation, slot.header.history_request());
            }
        }

        self.connections.retain(|index, _| {
            let keep = live.contains(index);
            if !keep {
                tracing::debug!(port = %self.id(), subscriber = *index, "disconnected subscriber");
            }
            keep
        });
        self.seen_epoch.store(epoch, Ordering::Release);
    }

    fn deliver_history(&self, index: u32, generation: u32, request: u32) {
        if request == 0 {
            return;
        }
        for chunk in self.slot().newest_history(&self.segment, request as usize) {
            if let Delivery::Refused(err) = self.push_to(index, generation, chunk, None) {
                tracing::debug!(subscriber = index, reason = %err.reason, "history entry not delivered");
            }
        }
    }

    fn push_to(
        &self,
        index: u32,
        generation: u32,
        chunk: SharedChunk,
        deadline: Option<Instant>,
    ) -> Delivery {
        let Some(slot) = self.segment.ports().subscriber(index) else {
            return Delivery::Gone;
        };
        if !slot.header.enter_push(generation) {
            return Delivery::Gone;
        }
        let result = match deadline {
            Some(deadline) => slot.queue.push_while(chunk, deadline, || {
                slot.header.is(generation, PortState::Active)
            }),
            None => slot.queue.try_push(chunk),
        };
        slot.header.leave_push();
        match result {
            Ok(outcome) => Delivery::Sent(outcome),
            Err(err) if err.reason == QueueFullReason::Disconnected => Delivery::Gone,
            Err(err) => Delivery::Refused(err),
        }
    }

    fn record(report: &mut PublishReport, outcome: PushOutcome) {
        report.delivered += 1;
        if let PushOutcome::DiscardedOldest { count } = outcome {
            report.discarded += count;
        }
    }

    /// Non-blocking pass over every connection, then one bounded wait for
    /// the blocking queues that were full.
    fn deliver(&self, chunk: &SharedChunk, report: &mut PublishReport) {
        let targets: Vec<(u32, u32)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().generation))
            .collect();

        let mut blocked = Vec::new();
        let mut longest_wait = Duration::ZERO;
        for (index, generation) in targets {
            match self.push_to(index, generation, chunk.clone(), None) {
                Delivery::Sent(outcome) => Self::record(report, outcome),
                Delivery::Refused(err) => {
                    let slot = self.segment.ports().subscriber_slot(index);
                    if slot.queue.policy() == OverflowPolicy::Block {
                        longest_wait = longest_wait.max(slot.queue.block_timeout());
                        blocked.push((index, generation, err.chunk));
                    } else {
                        report.rejected += 1;
                        tracing::warn!(port = %self.id(), subscriber = index, "subscriber queue full; chunk rejected");
                    }
                }
                Delivery::Gone => {
                    self.connections.remove(&index);
                }
            }
        }

        if blocked.is_empty() {
            return;
        }

        let deadline = Instant::now() + longest_wait;
        for (index, generation, pending) in blocked {
            match self.push_to(index, generation, pending, Some(deadline)) {
                Delivery::Sent(outcome) => Self::record(report, outcome),
                Delivery::Refused(err) => {
                    if err.reason == QueueFullReason::Timeout {
                        report.timed_out += 1;
                    } else {
                        report.rejected += 1;
                    }
                    tracing::warn!(port = %self.id(), subscriber = index, reason = %err.reason, "blocking subscriber did not take chunk");
                }
                Delivery::Gone => {
                    self.connections.remove(&index);
                }
            }
        }
    }
}

impl PublishChunk for Publisher {
    fn publish_chunk(&self, loan: Loan<'_>) -> PublishReport {
        self.publish(loan)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop_offer();
        if let Some(parked) = self.take_previous() {
            self.slot().ledger.untrack(parked.chunk_ref());
        }
        self.segment
            .ports()
            .reclaim_publisher(self.segment.memory(), self.index, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::port::{Subscriber, SubscriberOptions};
    use crate::queue::QueueOptions;

    fn segment() -> Arc<Segment> {
        let config = SegmentConfig::new("publisher-test")
            .with_pool(64, 32)
            .with_pool(1024, 4);
        Segment::anonymous(&config).unwrap()
    }

    fn service() -> ServiceDescription {
        ServiceDescription::new("Radar", "FrontLeft", "Object").unwrap()
    }

    #[test]
    fn test_publish_without_subscribers_keeps_history() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        publisher.offer();
        let report = publisher.publish_copy_of(&42u64).unwrap();
        assert_eq!(report, PublishReport::default());
        assert_eq!(publisher.history_len(), 1);
        assert_eq!(publisher.outstanding_loans(), 0);
        assert_eq!(segment.memory().used_chunks(), 1);

        drop(publisher);
        assert_eq!(segment.memory().used_chunks(), 0);
    }

    #[test]
    fn test_dropped_loan_is_parked() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let mut loan = publisher.loan(16, 8).unwrap();
        loan.payload_mut().copy_from_slice(&[7u8; 16]);
        let chunk = loan.chunk_ref();
        drop(loan);

        assert_eq!(publisher.outstanding_loans(), 1);
        let loan = publisher.loan_previous().unwrap();
        assert_eq!(loan.chunk_ref(), chunk);
        assert_eq!(loan.payload(), &[7u8; 16]);
        assert!(publisher.loan_previous().is_none());
    }

    #[test]
    fn test_too_many_loans() {
        let segment = segment();
        let options = PublisherOptions {
            max_loans: 2,
            ..PublisherOptions::default()
        };
        let publisher = Publisher::new(Arc::clone(&segment), service(), options).unwrap();
        let _a = publisher.loan(8, 8).unwrap();
        let _b = publisher.loan(8, 8).unwrap();
        assert_eq!(
            publisher.loan(8, 8).err(),
            Some(AllocationError::TooManyLoans { limit: 2 })
        );
        // The failed loan's chunk went back to the pool.
        assert_eq!(segment.memory().used_chunks(), 2);
    }

    #[test]
    fn test_parked_loan_is_evicted_for_new_loan() {
        let segment = segment();
        let options = PublisherOptions {
            max_loans: 1,
            ..PublisherOptions::default()
        };
        let publisher = Publisher::new(Arc::clone(&segment), service(), options).unwrap();
        drop(publisher.loan(8, 8).unwrap());
        let loan = publisher.loan(8, 8).unwrap();
        assert!(publisher.loan_previous().is_none());
        assert_eq!(segment.memory().used_chunks(), 1);
        drop(loan);
    }

    #[test]
    fn test_publish_stamps_metadata() {
        let segment = segment();
        let options = PublisherOptions {
            checksum: true,
            type_hint: 99,
            ..PublisherOptions::default()
        };
        let publisher = Publisher::new(Arc::clone(&segment), service(), options).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions::default(),
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();

        publisher.publish_copy_of(&1u32).unwrap();
        publisher.publish_copy_of(&2u32).unwrap();

        let first = subscriber.take().unwrap().unwrap();
        let second = subscriber.take().unwrap().unwrap();
        let meta = second.metadata();
        assert_eq!(first.metadata().sequence, 0);
        assert_eq!(meta.sequence, 1);
        assert_eq!(meta.type_hint, 99);
        assert_eq!(meta.origin, Some(publisher.id()));
        assert!(meta.timestamp_ns > 0);
        assert_eq!(second.verify_checksum(), Some(true));
        assert_eq!(&*second, &2u32.to_ne_bytes());
    }

    #[test]
    fn test_publish_result_of_allocation_failure() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let result = publisher.publish_result_of(1 << 20, 8, |_| unreachable!());
        assert!(matches!(
            result,
            Err(AllocationError::SizeExceedsConfiguredMax { .. })
        ));
    }

    #[test]
    fn test_block_subscriber_times_out() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let subscriber = Subscriber::new(
            Arc::clone(&segment),
            service(),
            SubscriberOptions {
                queue: QueueOptions {
                    capacity: 1,
                    overflow_policy: OverflowPolicy::Block,
                    block_timeout: Duration::from_millis(20),
                },
                ..SubscriberOptions::default()
            },
        )
        .unwrap();
        subscriber.subscribe();
        publisher.offer();

        assert_eq!(publisher.publish_copy_of(&1u8).unwrap().delivered, 1);
        let start = Instant::now();
        let report = publisher.publish_copy_of(&2u8).unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.delivered, 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_publish_chunk_trait_object() {
        let segment = segment();
        let publisher =
            Publisher::new(Arc::clone(&segment), service(), PublisherOptions::default()).unwrap();
        let sink: &dyn PublishChunk = &publisher;
        let loan = publisher.loan(8, 8).unwrap();
        assert_eq!(sink.publish_chunk(loan), PublishReport::default());
        assert_eq!(publisher.history_len(), 1);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let segment = segment();
        let options = PublisherOptions {
            history_capacity: 1000,
            ..PublisherOptions::default()
        };
        assert!(Publisher::new(segment, service(), options).is_err());
    }
}
