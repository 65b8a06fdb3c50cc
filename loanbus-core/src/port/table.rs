// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-segment port table.
//!
//! A fixed array of publisher slots and one of subscriber slots. Each slot
//! holds the owner's identity, its used-chunk ledger and either a history
//! ring (publishers) or a receive queue (subscribers). Slot ownership is a
//! single `control` word packing `generation << 32 | state`, so every
//! transition is one compare-and-swap and a stale generation never matches.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::publisher::PublisherOptions;
use super::subscriber::SubscriberOptions;
use crate::error::PortError;
use crate::ledger::{LedgerHeader, LedgerSlot, UsedChunkLedger};
use crate::mempool::{ChunkRef, MemoryManager, SharedChunk};
use crate::queue::{ChunkQueue, QueueCell, QueueHeader, QueueOptions};
use crate::shm::{PortSlotLayout, Segment, SegmentLayout};
use crate::types::{PortId, PortKind, ProcessId, ServiceDescription, SERVICE_ID_MAX_LEN};

/// How long reclamation waits for in-flight pushes into a dying port.
const PUSHER_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

const GENERATION_MASK: u32 = 0x7FFF_FFFF;

/// Lifecycle of a port slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Free,
    /// Claimed; not offering (publisher) or not subscribed (subscriber).
    Idle,
    /// Offering (publisher) or subscribed (subscriber).
    Active,
    /// Being claimed or torn down; nobody may use it.
    Reclaiming,
}

impl PortState {
    const fn to_u32(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Idle => 1,
            Self::Active => 2,
            Self::Reclaiming => 3,
        }
    }

    const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Idle,
            2 => Self::Active,
            _ => Self::Reclaiming,
        }
    }
}

#[inline]
pub(crate) fn control(generation: u32, state: PortState) -> u64 {
    ((generation as u64) << 32) | state.to_u32() as u64
}

#[repr(C, align(64))]
pub struct PortTableHeader {
    topology_epoch: AtomicU64,
}

/// Service description stored inline as three length-prefixed byte strings.
#[repr(C)]
pub struct ServiceRecord {
    lens: [AtomicU8; 3],
    parts: [[AtomicU8; SERVICE_ID_MAX_LEN]; 3],
}

impl ServiceRecord {
    fn store(&self, service: &ServiceDescription) {
        for (part, (len, bytes)) in service
            .parts()
            .iter()
            .zip(self.lens.iter().zip(&self.parts))
        {
            for (dst, src) in bytes.iter().zip(part.as_bytes()) {
                dst.store(*src, Ordering::Relaxed);
            }
            len.store(part.len() as u8, Ordering::Relaxed);
        }
    }

    fn part(&self, index: usize) -> Vec<u8> {
        let len = (self.lens[index].load(Ordering::Acquire) as usize).min(SERVICE_ID_MAX_LEN);
        self.parts[index][..len]
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed))
            .collect()
    }

    fn matches(&self, service: &ServiceDescription) -> bool {
        service
            .parts()
            .iter()
            .enumerate()
            .all(|(index, part)| self.part(index) == part.as_bytes())
    }

    fn load(&self) -> Option<ServiceDescription> {
        let parts: Vec<String> = (0..3)
            .map(|index| String::from_utf8_lossy(&self.part(index)).into_owned())
            .collect();
        ServiceDescription::new(parts[0].clone(), parts[1].clone(), parts[2].clone()).ok()
    }
}

/// Per-port bookkeeping shared by both slot kinds.
#[repr(C, align(64))]
pub struct PortSlotHeader {
    control: AtomicU64,
    owner_pid: AtomicU32,
    /// Producers currently pushing into this slot's queue.
    active_pushers: AtomicU32,
    history_capacity: AtomicU32,
    history_len: AtomicU32,
    history_head: AtomicU32,
    history_request: AtomicU32,
    sequence: AtomicU64,
    service: ServiceRecord,
}

impl PortSlotHeader {
    fn control_word(&self) -> u64 {
        self.control.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PortState {
        PortState::from_u32(self.control_word() as u32)
    }

    pub fn generation(&self) -> u32 {
        (self.control_word() >> 32) as u32
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub fn service(&self) -> Option<ServiceDescription> {
        self.service.load()
    }

    pub fn matches(&self, service: &ServiceDescription) -> bool {
        self.service.matches(service)
    }

    pub fn history_request(&self) -> u32 {
        self.history_request.load(Ordering::Acquire)
    }

    pub fn active_pushers(&self) -> u32 {
        self.active_pushers.load(Ordering::SeqCst)
    }

    /// Whether the slot is owned by `generation` and in `state`.
    pub fn is(&self, generation: u32, state: PortState) -> bool {
        self.control_word() == control(generation, state)
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Move between owned states. Fails if the slot changed hands.
    pub(crate) fn transition(&self, generation: u32, from: PortState, to: PortState) -> bool {
        self.control
            .compare_exchange(
                control(generation, from),
                control(generation, to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Register a push in flight. Returns `false` (and registers nothing)
    /// unless the slot is active under `generation`.
    pub(crate) fn enter_push(&self, generation: u32) -> bool {
        self.active_pushers.fetch_add(1, Ordering::SeqCst);
        if self.is(generation, PortState::Active) {
            true
        } else {
            self.active_pushers.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    pub(crate) fn leave_push(&self) {
        self.active_pushers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A claimed slot as seen by a scan of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedPort {
    pub id: PortId,
    pub state: PortState,
    /// Owner, or the process currently claiming or tearing the slot down.
    pub owner_pid: u32,
}

/// A publisher's slot.
pub struct PublisherSlot<'a> {
    pub header: &'a PortSlotHeader,
    pub ledger: UsedChunkLedger<'a>,
    history: &'a [AtomicU64],
}

impl<'a> PublisherSlot<'a> {
    pub fn history_capacity(&self) -> usize {
        (self.header.history_capacity.load(Ordering::Acquire) as usize).min(self.history.len())
    }

    pub fn history_len(&self) -> usize {
        (self.header.history_len.load(Ordering::Acquire) as usize).min(self.history_capacity())
    }

    /// Keep `chunk` as the newest history entry, releasing the entry it
    /// replaces. Owner only.
    pub(crate) fn push_history(&self, chunk: SharedChunk) {
        let capacity = self.history_capacity();
        if capacity == 0 {
            return;
        }
        let head = self.header.history_head.load(Ordering::Acquire) as usize % capacity;
        let memory = chunk.segment().memory();
        let replaced = ChunkRef::from_raw(
            self.history[head].swap(chunk.chunk_ref().as_raw(), Ordering::AcqRel),
        );
        if !replaced.is_none() {
            memory.release(replaced);
        }
        chunk.into_raw();
        self.header
            .history_head
            .store(((head + 1) % capacity) as u32, Ordering::Release);
        let len = self.header.history_len.load(Ordering::Acquire) as usize;
        self.header
            .history_len
            .store((len + 1).min(capacity) as u32, Ordering::Release);
    }

    /// New handles to the newest `count` history entries, oldest first.
    pub(crate) fn newest_history(
        &self,
        segment: &Arc<Segment>,
        count: usize,
    ) -> Vec<SharedChunk> {
        let capacity = self.history_capacity();
        let count = count.min(self.history_len());
        if capacity == 0 || count == 0 {
            return Vec::new();
        }
        let head = self.header.history_head.load(Ordering::Acquire) as usize;
        (0..count)
            .rev()
            .filter_map(|age| {
                let index = (head + capacity - 1 - age) % capacity;
                let chunk = ChunkRef::from_raw(self.history[index].load(Ordering::Acquire));
                if chunk.is_none() || !segment.memory().retain(chunk) {
                    return None;
                }
                SharedChunk::from_raw(Arc::clone(segment), chunk)
            })
            .collect()
    }

    fn drain_history(&self, memory: &MemoryManager) -> usize {
        let mut released = 0;
        for entry in self.history {
            let chunk = ChunkRef::from_raw(entry.swap(ChunkRef::NONE.as_raw(), Ordering::AcqRel));
            if !chunk.is_none() {
                memory.release(chunk);
                released += 1;
            }
        }
        self.header.history_len.store(0, Ordering::Release);
        self.header.history_head.store(0, Ordering::Release);
        released
    }
}

/// A subscriber's slot.
pub struct SubscriberSlot<'a> {
    pub header: &'a PortSlotHeader,
    pub ledger: UsedChunkLedger<'a>,
    pub queue: ChunkQueue<'a>,
}

/// Process-local view of the port table of one segment.
pub struct PortTable {
    header: *const PortTableHeader,
    publishers: *mut u8,
    subscribers: *mut u8,
    publisher_slot: PortSlotLayout,
    subscriber_slot: PortSlotLayout,
    max_publishers: u32,
    max_subscribers: u32,
}

// SAFETY: the table only points into the segment mapping, which outlives
// it, and all shared state behind the pointers is atomic.
unsafe impl Send for PortTable {}
unsafe impl Sync for PortTable {}

impl PortTable {
    /// # Safety
    /// `base` must point to a mapping of at least `layout.total_size` bytes
    /// that outlives the returned table.
    pub(crate) unsafe fn from_layout(base: *mut u8, layout: &SegmentLayout) -> Self {
        Self {
            header: base.add(layout.port_table_offset) as *const PortTableHeader,
            publishers: base.add(layout.publishers_offset),
            subscribers: base.add(layout.subscribers_offset),
            publisher_slot: layout.publisher_slot,
            subscriber_slot: layout.subscriber_slot,
            max_publishers: layout.limits.max_publishers,
            max_subscribers: layout.limits.max_subscribers,
        }
    }

    fn table_header(&self) -> &PortTableHeader {
        // SAFETY: valid for the table's lifetime per from_layout's contract
        unsafe { &*self.header }
    }

    /// Changes whenever a subscriber connects, disconnects or is reclaimed.
    pub fn epoch(&self) -> u64 {
        self.table_header().topology_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) {
        self.table_header()
            .topology_epoch
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Put every slot of a freshly created segment into its empty state.
    pub(crate) fn format(&self) {
        for index in 0..self.max_publishers {
            let slot = self.publisher_slot(index);
            slot.ledger.init(0);
            for entry in slot.history {
                entry.store(ChunkRef::NONE.as_raw(), Ordering::Relaxed);
            }
        }
        for index in 0..self.max_subscribers {
            let slot = self.subscriber_slot(index);
            slot.ledger.init(0);
            slot.queue.init(&QueueOptions::default());
        }
    }

    pub fn max_publishers(&self) -> u32 {
        self.max_publishers
    }

    pub fn max_subscribers(&self) -> u32 {
        self.max_subscribers
    }

    /// # Safety
    /// `slot_base` must be the start of a slot laid out by `layout`.
    unsafe fn ledger_at<'a>(slot_base: *mut u8, layout: &PortSlotLayout) -> UsedChunkLedger<'a> {
        let header = &*(slot_base.add(layout.ledger_header_offset) as *const LedgerHeader);
        let slots = std::slice::from_raw_parts(
            slot_base.add(layout.ledger_slots_offset) as *const LedgerSlot,
            layout.ledger_table_size,
        );
        UsedChunkLedger::new(header, slots)
    }

    pub fn publisher(&self, index: u32) -> Option<PublisherSlot<'_>> {
        (index < self.max_publishers).then(|| self.publisher_slot(index))
    }

    /// Slot of a publisher index already known to be in bounds.
    pub(crate) fn publisher_slot(&self, index: u32) -> PublisherSlot<'_> {
        assert!(index < self.max_publishers, "publisher index out of bounds");
        let layout = &self.publisher_slot;
        // SAFETY: index is in bounds, so the slot lies inside the mapping
        unsafe {
            let base = self.publishers.add(index as usize * layout.stride);
            PublisherSlot {
                header: &*(base as *const PortSlotHeader),
                ledger: Self::ledger_at(base, layout),
                history: std::slice::from_raw_parts(
                    base.add(layout.tail_offset) as *const AtomicU64,
                    layout.tail_len,
                ),
            }
        }
    }

    pub fn subscriber(&self, index: u32) -> Option<SubscriberSlot<'_>> {
        (index < self.max_subscribers).then(|| self.subscriber_slot(index))
    }

    /// Slot of a subscriber index already known to be in bounds.
    pub(crate) fn subscriber_slot(&self, index: u32) -> SubscriberSlot<'_> {
        assert!(index < self.max_subscribers, "subscriber index out of bounds");
        let layout = &self.subscriber_slot;
        // SAFETY: index is in bounds, so the slot lies inside the mapping
        unsafe {
            let base = self.subscribers.add(index as usize * layout.stride);
            SubscriberSlot {
                header: &*(base as *const PortSlotHeader),
                ledger: Self::ledger_at(base, layout),
                queue: ChunkQueue::new(
                    &*(base.add(layout.tail_offset) as *const QueueHeader),
                    std::slice::from_raw_parts(
                        base.add(layout.cells_offset) as *const QueueCell,
                        layout.tail_len,
                    ),
                ),
            }
        }
    }

    /// Take ownership of a free slot. Returns the new generation; the slot
    /// is left in `Reclaiming` until the caller finishes initialization.
    ///
    /// The claimer's pid is stored on both sides of the CAS, so a claimer
    /// that dies before `finish_claim` leaves a pid the reaper can check.
    fn begin_claim(header: &PortSlotHeader, pid: ProcessId) -> Option<u32> {
        let current = header.control.load(Ordering::SeqCst);
        if PortState::from_u32(current as u32) != PortState::Free {
            return None;
        }
        let mut generation = ((current >> 32) as u32).wrapping_add(1) & GENERATION_MASK;
        if generation == 0 {
            generation = 1;
        }
        header.owner_pid.store(pid.value(), Ordering::SeqCst);
        header
            .control
            .compare_exchange(
                current,
                control(generation, PortState::Reclaiming),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;
        // A losing claimer may have overwritten the pid in between.
        header.owner_pid.store(pid.value(), Ordering::SeqCst);
        Some(generation)
    }

    fn finish_claim(
        header: &PortSlotHeader,
        generation: u32,
        pid: ProcessId,
        service: &ServiceDescription,
    ) {
        header.owner_pid.store(pid.value(), Ordering::Relaxed);
        header.active_pushers.store(0, Ordering::Relaxed);
        header.sequence.store(0, Ordering::Relaxed);
        header.service.store(service);
        header
            .control
            .store(control(generation, PortState::Idle), Ordering::SeqCst);
    }

    pub(crate) fn claim_publisher(
        &self,
        memory: &MemoryManager,
        pid: ProcessId,
        service: &ServiceDescription,
        options: &PublisherOptions,
    ) -> Result<(u32, u32), PortError> {
        for index in 0..self.max_publishers {
            let slot = self.publisher_slot(index);
            let Some(generation) = Self::begin_claim(slot.header, pid) else {
                continue;
            };
            let leftover = slot.ledger.purge_all(memory) + slot.drain_history(memory);
            if leftover > 0 {
                tracing::warn!(index, leftover, "released leftover chunks of publisher slot");
            }
            slot.ledger.init(options.max_loans);
            for entry in slot.history {
                entry.store(ChunkRef::NONE.as_raw(), Ordering::Relaxed);
            }
            slot.header
                .history_capacity
                .store(options.history_capacity, Ordering::Relaxed);
            slot.header.history_len.store(0, Ordering::Relaxed);
            slot.header.history_head.store(0, Ordering::Relaxed);
            slot.header.history_request.store(0, Ordering::Relaxed);
            Self::finish_claim(slot.header, generation, pid, service);

            tracing::debug!(index, generation, service = %service, "claimed publisher port");
            return Ok((index, generation));
        }
        Err(PortError::NoFreeSlot {
            kind: PortKind::Publisher.name(),
            max: self.max_publishers as usize,
        })
    }

    pub(crate) fn claim_subscriber(
        &self,
        memory: &MemoryManager,
        pid: ProcessId,
        service: &ServiceDescription,
        options: &SubscriberOptions,
    ) -> Result<(u32, u32), PortError> {
        for index in 0..self.max_subscribers {
            let slot = self.subscriber_slot(index);
            let Some(generation) = Self::begin_claim(slot.header, pid) else {
                continue;
            };
            let leftover = slot.ledger.purge_all(memory) + slot.queue.drain(memory);
            if leftover > 0 {
                tracing::warn!(index, leftover, "released leftover chunks of subscriber slot");
            }
            slot.ledger.init(options.max_chunks_held);
            slot.queue.init(&options.queue);
            slot.header.history_capacity.store(0, Ordering::Relaxed);
            slot.header
                .history_request
                .store(options.history_request, Ordering::Relaxed);
            Self::finish_claim(slot.header, generation, pid, service);

            tracing::debug!(index, generation, service = %service, "claimed subscriber port");
            return Ok((index, generation));
        }
        Err(PortError::NoFreeSlot {
            kind: PortKind::Subscriber.name(),
            max: self.max_subscribers as usize,
        })
    }

    /// Move an owned slot to `Reclaiming`.
    fn begin_reclaim(&self, header: &PortSlotHeader, generation: u32) -> bool {
        let claimed = [PortState::Idle, PortState::Active]
            .into_iter()
            .any(|state| header.transition(generation, state, PortState::Reclaiming));
        if claimed {
            self.bump_epoch();
        }
        claimed
    }

    /// Wait for in-flight pushes into a slot that left `Active`. Returns
    /// `false` if some were still running at the deadline.
    fn wait_for_pushers(header: &PortSlotHeader, kind: PortKind, index: u32) -> bool {
        let deadline = Instant::now() + PUSHER_DRAIN_TIMEOUT;
        while header.active_pushers() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    kind = kind.name(),
                    index,
                    pushers = header.active_pushers(),
                    "in-flight pushes did not finish; reclaiming anyway"
                );
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    /// Release everything a subscriber slot references. Producers that
    /// were still pushing are waited for once more and their leftovers
    /// drained as well.
    fn clear_subscriber(slot: &SubscriberSlot<'_>, memory: &MemoryManager, index: u32) -> usize {
        slot.queue.wake_producers();
        let settled = Self::wait_for_pushers(slot.header, PortKind::Subscriber, index);
        let mut released = slot.ledger.purge_all(memory) + slot.queue.drain(memory);
        if !settled {
            Self::wait_for_pushers(slot.header, PortKind::Subscriber, index);
            released += slot.queue.drain(memory);
        }
        released
    }

    fn finish_reclaim(header: &PortSlotHeader, generation: u32) {
        header.owner_pid.store(0, Ordering::Relaxed);
        header
            .control
            .store(control(generation, PortState::Free), Ordering::SeqCst);
    }

    /// Tear down a publisher slot owned by `generation`. Returns the number
    /// of chunk references released, or `None` if the slot changed hands.
    pub(crate) fn reclaim_publisher(
        &self,
        memory: &MemoryManager,
        index: u32,
        generation: u32,
    ) -> Option<usize> {
        let slot = self.publisher(index)?;
        if !self.begin_reclaim(slot.header, generation) {
            return None;
        }
        let released = slot.ledger.purge_all(memory) + slot.drain_history(memory);
        Self::finish_reclaim(slot.header, generation);
        tracing::debug!(index, generation, released, "reclaimed publisher port");
        Some(released)
    }

    /// Tear down a subscriber slot owned by `generation`.
    pub(crate) fn reclaim_subscriber(
        &self,
        memory: &MemoryManager,
        index: u32,
        generation: u32,
    ) -> Option<usize> {
        let slot = self.subscriber(index)?;
        if !self.begin_reclaim(slot.header, generation) {
            return None;
        }
        let released = Self::clear_subscriber(&slot, memory, index);
        Self::finish_reclaim(slot.header, generation);
        tracing::debug!(index, generation, released, "reclaimed subscriber port");
        Some(released)
    }

    /// Tear down a slot whose recorded owner is dead, on behalf of
    /// `reaper`. Also finishes slots the dead process left halfway through
    /// a claim or a reclaim. Returns the number of chunk references
    /// released, or `None` if another process got there first.
    pub(crate) fn reap(
        &self,
        memory: &MemoryManager,
        port: ClaimedPort,
        reaper: ProcessId,
    ) -> Option<usize> {
        let PortId {
            kind,
            index,
            generation,
        } = port.id;
        let header = match kind {
            PortKind::Publisher => self.publisher(index)?.header,
            PortKind::Subscriber => self.subscriber(index)?.header,
        };
        // Only one survivor may take over a dead owner's slot.
        header
            .owner_pid
            .compare_exchange(
                port.owner_pid,
                reaper.value(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;

        if !header.is(generation, PortState::Reclaiming) {
            return match kind {
                PortKind::Publisher => self.reclaim_publisher(memory, index, generation),
                PortKind::Subscriber => self.reclaim_subscriber(memory, index, generation),
            };
        }

        let released = match kind {
            PortKind::Publisher => {
                let slot = self.publisher_slot(index);
                slot.ledger.purge_all(memory) + slot.drain_history(memory)
            }
            PortKind::Subscriber => {
                Self::clear_subscriber(&self.subscriber_slot(index), memory, index)
            }
        };
        Self::finish_reclaim(header, generation);
        tracing::warn!(
            kind = kind.name(),
            index,
            generation,
            released,
            "finished teardown abandoned mid-claim or mid-reclaim"
        );
        Some(released)
    }

    /// Every slot that is not free: owned, being claimed or being torn down.
    pub fn claimed_ports(&self) -> Vec<ClaimedPort> {
        let publishers = (0..self.max_publishers).filter_map(|index| {
            Self::claimed(self.publisher_slot(index).header, PortKind::Publisher, index)
        });
        let subscribers = (0..self.max_subscribers).filter_map(|index| {
            Self::claimed(self.subscriber_slot(index).header, PortKind::Subscriber, index)
        });
        publishers.chain(subscribers).collect()
    }

    fn claimed(header: &PortSlotHeader, kind: PortKind, index: u32) -> Option<ClaimedPort> {
        let word = header.control_word();
        let state = PortState::from_u32(word as u32);
        (state != PortState::Free).then(|| ClaimedPort {
            id: PortId {
                kind,
                index,
                generation: (word >> 32) as u32,
            },
            state,
            owner_pid: header.owner_pid(),
        })
    }
}
