// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bounded lock-free queue of chunk references.
//!
//! Each subscriber owns one queue in shared memory. Producers in any
//! process push `ChunkRef`s, the subscriber pops them. The ring is a
//! bounded MPMC queue with a sequence number per cell, so neither side
//! ever holds a lock a crashed peer could leave taken.

use std::fmt;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{QueueFull, QueueFullReason};
use crate::mempool::{ChunkRef, MemoryManager, SharedChunk};
use crate::shm::{futex, Segment};

/// Longest single futex sleep. Bounds the cost of a missed wakeup.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Failed pops a discarding push tolerates before giving up. A head cell
/// that stays unpublished belongs to a producer that stalled or died.
const DISCARD_STALL_LIMIT: u32 = 64;

/// What a push does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for space up to the block timeout.
    Block,
    /// Drop the oldest entry to make room.
    DiscardOldest,
    /// Refuse the new entry.
    Reject,
}

impl OverflowPolicy {
    const fn to_u32(self) -> u32 {
        match self {
            Self::Block => 0,
            Self::DiscardOldest => 1,
            Self::Reject => 2,
        }
    }

    const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Block,
            2 => Self::Reject,
            _ => Self::DiscardOldest,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DiscardOldest => "discard-oldest",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Queue parameters chosen by the subscriber when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub capacity: u32,
    pub overflow_policy: OverflowPolicy,
    pub block_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 16,
            overflow_policy: OverflowPolicy::DiscardOldest,
            block_timeout: Duration::from_millis(100),
        }
    }
}

/// A successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Enqueued after dropping `count` older entries.
    DiscardedOldest { count: u64 },
}

#[repr(C, align(64))]
#[derive(Default)]
struct Position(AtomicU64);

#[repr(C, align(64))]
#[derive(Default)]
pub struct QueueHeader {
    capacity: AtomicU32,
    policy: AtomicU32,
    block_timeout_us: AtomicU64,
    discarded: AtomicU64,
    /// Bumped after every pop; blocked producers sleep on it.
    space_futex: AtomicU32,
    space_waiters: AtomicU32,
    /// Bumped after every push; idle consumers sleep on it.
    data_futex: AtomicU32,
    data_waiters: AtomicU32,
    enqueue_pos: Position,
    dequeue_pos: Position,
}

#[repr(C)]
#[derive(Default)]
pub struct QueueCell {
    sequence: AtomicU64,
    value: AtomicU64,
}

/// View of a queue living in shared memory.
#[derive(Clone, Copy)]
pub struct ChunkQueue<'a> {
    header: &'a QueueHeader,
    cells: &'a [QueueCell],
}

impl<'a> ChunkQueue<'a> {
    pub fn new(header: &'a QueueHeader, cells: &'a [QueueCell]) -> Self {
        Self { header, cells }
    }

    /// Reset the queue with new options. Only valid while no other party
    /// uses it; leftover entries must have been drained.
    ///
    /// The ring has one cell per slot of backing storage; `capacity` only
    /// limits how many of them may be occupied at once.
    pub fn init(&self, options: &QueueOptions) {
        let capacity = options.capacity.clamp(1, self.cells.len().max(1) as u32);
        for (index, cell) in self.cells.iter().enumerate() {
            cell.sequence.store(index as u64, Ordering::Relaxed);
            cell.value.store(ChunkRef::NONE.as_raw(), Ordering::Relaxed);
        }
        let header = self.header;
        header.enqueue_pos.0.store(0, Ordering::Relaxed);
        header.dequeue_pos.0.store(0, Ordering::Relaxed);
        header.discarded.store(0, Ordering::Relaxed);
        header
            .policy
            .store(options.overflow_policy.to_u32(), Ordering::Relaxed);
        header.block_timeout_us.store(
            options.block_timeout.as_micros().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        header.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.header.capacity.load(Ordering::Acquire) as usize
    }

    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_u32(self.header.policy.load(Ordering::Acquire))
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_micros(self.header.block_timeout_us.load(Ordering::Acquire))
    }

    /// Entries dropped by the discard-oldest policy since init.
    pub fn discarded(&self) -> u64 {
        self.header.discarded.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let dequeued = self.header.dequeue_pos.0.load(Ordering::Acquire);
        let enqueued = self.header.enqueue_pos.0.load(Ordering::Acquire);
        (enqueued.saturating_sub(dequeued) as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ring(&self) -> u64 {
        self.cells.len() as u64
    }

    /// One non-blocking enqueue attempt.
    fn try_push_raw(&self, chunk: ChunkRef) -> bool {
        let capacity = self.capacity() as u64;
        let ring = self.ring();
        if capacity == 0 || ring == 0 {
            return false;
        }
        let tail = &self.header.enqueue_pos.0;
        let head = &self.header.dequeue_pos.0;
        let mut pos = tail.load(Ordering::Relaxed);
        loop {
            if pos.saturating_sub(head.load(Ordering::Acquire)) >= capacity {
                return false;
            }
            let cell = &self.cells[(pos % ring) as usize];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence.wrapping_sub(pos) as i64;
            if diff == 0 {
                match tail.compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        cell.value.store(chunk.as_raw(), Ordering::Relaxed);
                        cell.sequence.store(pos + 1, Ordering::Release);
                        self.notify(&self.header.data_futex, &self.header.data_waiters);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                let current = tail.load(Ordering::Relaxed);
                // A cell ahead of an unmoved tail was never reset properly.
                if current == pos {
                    return false;
                }
                pos = current;
            }
        }
    }

    /// Pop the oldest reference without wrapping it in a handle.
    ///
    /// The caller owns the returned reference.
    pub fn pop_raw(&self) -> Option<ChunkRef> {
        let ring = self.ring();
        if self.capacity() == 0 || ring == 0 {
            return None;
        }
        let head = &self.header.dequeue_pos.0;
        let mut pos = head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos % ring) as usize];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence.wrapping_sub(pos + 1) as i64;
            if diff == 0 {
                match head.compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.sequence.store(pos + ring, Ordering::Release);
                        self.notify(&self.header.space_futex, &self.header.space_waiters);
                        return Some(ChunkRef::from_raw(value));
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                let current = head.load(Ordering::Relaxed);
                if current == pos {
                    return None;
                }
                pos = current;
            }
        }
    }

    fn notify(&self, word: &AtomicU32, waiters: &AtomicU32) {
        // Pairs with the fence in `wait_on`.
        fence(Ordering::SeqCst);
        if waiters.load(Ordering::Relaxed) > 0 {
            futex::signal(word);
        }
    }

    /// Sleep on `word` unless `ready` turns true first. Returns `ready()`.
    fn wait_on(
        &self,
        word: &AtomicU32,
        waiters: &AtomicU32,
        deadline: Instant,
        ready: impl Fn() -> bool,
    ) -> bool {
        let observed = word.load(Ordering::Acquire);
        waiters.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if !ready() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                futex::wait(word, observed, remaining.min(WAIT_SLICE));
            }
        }
        waiters.fetch_sub(1, Ordering::Relaxed);
        ready()
    }

    /// Push according to the queue's overflow policy.
    ///
    /// `Block` waits up to the configured block timeout.
    pub fn push(&self, chunk: SharedChunk) -> Result<PushOutcome, QueueFull> {
        match self.policy() {
            OverflowPolicy::Block => {
                let deadline = Instant::now() + self.block_timeout();
                self.push_until(chunk, deadline)
            }
            _ => self.try_push(chunk),
        }
    }

    /// Push without waiting. Under `Block` a full queue fails with
    /// `QueueFullReason::Full`.
    pub fn try_push(&self, chunk: SharedChunk) -> Result<PushOutcome, QueueFull> {
        match self.policy() {
            OverflowPolicy::DiscardOldest => self.push_discarding(chunk),
            OverflowPolicy::Block | OverflowPolicy::Reject => {
                if self.try_push_raw(chunk.chunk_ref()) {
                    chunk.into_raw();
                    Ok(PushOutcome::Enqueued)
                } else {
                    Err(QueueFull {
                        reason: QueueFullReason::Full,
                        chunk,
                    })
                }
            }
        }
    }

    /// Push, waiting for space until `deadline` if the policy is `Block`.
    pub fn push_until(
        &self,
        chunk: SharedChunk,
        deadline: Instant,
    ) -> Result<PushOutcome, QueueFull> {
        self.push_while(chunk, deadline, || true)
    }

    /// Like `push_until`, but gives up with `QueueFullReason::Disconnected`
    /// as soon as `connected` turns false. Checked before every attempt, so
    /// a waiting producer never enqueues into a queue its owner abandoned.
    pub fn push_while(
        &self,
        chunk: SharedChunk,
        deadline: Instant,
        connected: impl Fn() -> bool,
    ) -> Result<PushOutcome, QueueFull> {
        if self.policy() != OverflowPolicy::Block {
            return self.try_push(chunk);
        }

        let raw = chunk.chunk_ref();
        loop {
            if !connected() {
                return Err(QueueFull {
                    reason: QueueFullReason::Disconnected,
                    chunk,
                });
            }
            if self.try_push_raw(raw) {
                chunk.into_raw();
                return Ok(PushOutcome::Enqueued);
            }
            if Instant::now() >= deadline {
                return Err(QueueFull {
                    reason: QueueFullReason::Timeout,
                    chunk,
                });
            }
            let header = self.header;
            self.wait_on(&header.space_futex, &header.space_waiters, deadline, || {
                self.len() < self.capacity() || !connected()
            });
        }
    }

    fn push_discarding(&self, chunk: SharedChunk) -> Result<PushOutcome, QueueFull> {
        let raw = chunk.chunk_ref();
        let mut count = 0;
        let mut stalls = 0;
        while !self.try_push_raw(raw) {
            match self.pop_raw() {
                Some(oldest) => {
                    chunk.segment().memory().release(oldest);
                    self.header.discarded.fetch_add(1, Ordering::AcqRel);
                    count += 1;
                }
                None => {
                    stalls += 1;
                    if stalls >= DISCARD_STALL_LIMIT {
                        tracing::warn!(
                            chunk = %raw,
                            "queue head never published; dropping chunk instead of discarding"
                        );
                        return Err(QueueFull {
                            reason: QueueFullReason::Full,
                            chunk,
                        });
                    }
                    std::thread::yield_now();
                }
            }
        }
        chunk.into_raw();
        Ok(if count == 0 {
            PushOutcome::Enqueued
        } else {
            PushOutcome::DiscardedOldest { count }
        })
    }

    /// Wake every producer sleeping for space so it re-checks its
    /// connection.
    pub(crate) fn wake_producers(&self) {
        self.notify(&self.header.space_futex, &self.header.space_waiters);
    }

    /// Pop the oldest entry as an owned handle.
    pub fn pop(&self, segment: &Arc<Segment>) -> Option<SharedChunk> {
        let raw = self.pop_raw()?;
        SharedChunk::from_raw(Arc::clone(segment), raw)
    }

    /// Pop and release every entry. Returns how many were released.
    pub fn drain(&self, memory: &MemoryManager) -> usize {
        let mut released = 0;
        while let Some(raw) = self.pop_raw() {
            memory.release(raw);
            released += 1;
        }
        released
    }

    /// Sleep until the queue is non-empty or `timeout` passes.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let header = self.header;
        loop {
            if self.wait_on(&header.data_futex, &header.data_waiters, deadline, || {
                !self.is_empty()
            }) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }
}
