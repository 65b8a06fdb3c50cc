// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Byte layout of a segment.
//!
//! ```text
//! [SegmentHeader]
//! [PoolHeader][next links][chunks ...]            per pool, ascending size
//! [PortTableHeader]
//! [publisher slot] * max_publishers               header, ledger, history
//! [subscriber slot] * max_subscribers             header, ledger, queue
//! ```
//!
//! The layout is a pure function of the pool configuration and port limits,
//! both recorded in the header, so a process opening the segment recomputes
//! identical offsets.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{PoolConfig, PortLimits};
use crate::error::SharedMemoryError;
use crate::ledger::{LedgerHeader, LedgerSlot};
use crate::mempool::{align_up, chunk_stride, PoolHeader};
use crate::port::{PortSlotHeader, PortTableHeader};
use crate::queue::{QueueCell, QueueHeader};
use crate::shm::SharedMemoryRegion;

/// "LOANBUS1"
pub const SEGMENT_MAGIC: u64 = 0x4C4F_414E_4255_5331;

pub const SEGMENT_VERSION: u32 = 1;

/// Number of size classes a segment can describe.
pub const MAX_POOLS: usize = 16;

const CACHE_LINE: usize = 64;
const PAGE_SIZE: usize = 4096;

#[repr(C)]
pub struct PoolDescriptor {
    pub chunk_size: AtomicU32,
    pub chunk_count: AtomicU32,
}

/// First bytes of every segment. `magic` is stored last, with release
/// ordering, once everything behind it is initialized.
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub pool_count: AtomicU32,
    pub total_size: AtomicU64,
    pub creator_pid: AtomicU32,
    pub max_publishers: AtomicU32,
    pub max_subscribers: AtomicU32,
    pub max_queue_capacity: AtomicU32,
    pub max_chunks_held: AtomicU32,
    pub max_history: AtomicU32,
    pub pools: [PoolDescriptor; MAX_POOLS],
}

impl SegmentHeader {
    /// Record geometry. Magic is left for `publish`.
    pub(crate) fn write(&self, layout: &SegmentLayout) {
        self.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        self.pool_count
            .store(layout.pools.len() as u32, Ordering::Relaxed);
        self.total_size
            .store(layout.total_size as u64, Ordering::Relaxed);
        self.creator_pid.store(std::process::id(), Ordering::Relaxed);
        self.max_publishers
            .store(layout.limits.max_publishers, Ordering::Relaxed);
        self.max_subscribers
            .store(layout.limits.max_subscribers, Ordering::Relaxed);
        self.max_queue_capacity
            .store(layout.limits.max_queue_capacity, Ordering::Relaxed);
        self.max_chunks_held
            .store(layout.limits.max_chunks_held, Ordering::Relaxed);
        self.max_history
            .store(layout.limits.max_history, Ordering::Relaxed);
        for (descriptor, pool) in self.pools.iter().zip(&layout.pools) {
            descriptor
                .chunk_size
                .store(pool.chunk_size, Ordering::Relaxed);
            descriptor
                .chunk_count
                .store(pool.chunk_count, Ordering::Relaxed);
        }
    }

    pub(crate) fn publish(&self) {
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Rebuild the layout from a header written by another process.
    pub(crate) fn read(&self) -> Result<SegmentLayout, SharedMemoryError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!("bad magic {:#018x}", magic),
            });
        }

        let version = self.version.load(Ordering::Acquire);
        if version != SEGMENT_VERSION {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!(
                    "unsupported version {} (expected {})",
                    version, SEGMENT_VERSION
                ),
            });
        }

        let pool_count = self.pool_count.load(Ordering::Acquire) as usize;
        if pool_count == 0 || pool_count > MAX_POOLS {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!("invalid pool count {}", pool_count),
            });
        }

        let pools: Vec<PoolConfig> = self.pools[..pool_count]
            .iter()
            .map(|descriptor| PoolConfig {
                chunk_size: descriptor.chunk_size.load(Ordering::Acquire),
                chunk_count: descriptor.chunk_count.load(Ordering::Acquire),
            })
            .collect();

        let limits = PortLimits {
            max_publishers: self.max_publishers.load(Ordering::Acquire),
            max_subscribers: self.max_subscribers.load(Ordering::Acquire),
            max_queue_capacity: self.max_queue_capacity.load(Ordering::Acquire),
            max_chunks_held: self.max_chunks_held.load(Ordering::Acquire),
            max_history: self.max_history.load(Ordering::Acquire),
        };

        let layout = SegmentLayout::compute(&pools, &limits)?;
        let recorded = self.total_size.load(Ordering::Acquire) as usize;
        if layout.total_size != recorded {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!(
                    "recorded size {} does not match computed size {}",
                    recorded, layout.total_size
                ),
            });
        }
        Ok(layout)
    }
}

/// Offsets of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub stride: usize,
    pub header_offset: usize,
    pub next_offset: usize,
    pub chunks_offset: usize,
}

/// Offsets inside one port slot, relative to the slot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSlotLayout {
    pub stride: usize,
    pub ledger_header_offset: usize,
    pub ledger_slots_offset: usize,
    pub ledger_table_size: usize,
    /// History ring (publishers) or queue header (subscribers).
    pub tail_offset: usize,
    /// Queue cells (subscribers only).
    pub cells_offset: usize,
    /// History entries or queue cells.
    pub tail_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    pub pools: Vec<PoolLayout>,
    pub limits: PortLimits,
    pub port_table_offset: usize,
    pub publishers_offset: usize,
    pub publisher_slot: PortSlotLayout,
    pub subscribers_offset: usize,
    pub subscriber_slot: PortSlotLayout,
    pub total_size: usize,
}

/// Checked offset arithmetic that reports overflow as an oversized segment.
struct Cursor(usize);

impl Cursor {
    fn reserve(&mut self, bytes: usize, align: usize) -> Result<usize, SharedMemoryError> {
        let start = align_up(self.0, align);
        self.0 = start.checked_add(bytes).ok_or(SharedMemoryError::SegmentTooLarge {
            size: usize::MAX,
            max: SharedMemoryRegion::MAX_SIZE,
        })?;
        if self.0 > SharedMemoryRegion::MAX_SIZE {
            return Err(SharedMemoryError::SegmentTooLarge {
                size: self.0,
                max: SharedMemoryRegion::MAX_SIZE,
            });
        }
        Ok(start)
    }
}

fn slot_layout(limits: &PortLimits, with_queue: bool) -> PortSlotLayout {
    let ledger_table_size = (2 * limits.max_chunks_held as usize).next_power_of_two();
    let ledger_header_offset = align_up(std::mem::size_of::<PortSlotHeader>(), CACHE_LINE);
    let ledger_slots_offset = ledger_header_offset + std::mem::size_of::<LedgerHeader>();
    let ledger_end = ledger_slots_offset + ledger_table_size * std::mem::size_of::<LedgerSlot>();
    let tail_offset = align_up(ledger_end, CACHE_LINE);

    let (cells_offset, tail_len, end) = if with_queue {
        let cells_offset = tail_offset + std::mem::size_of::<QueueHeader>();
        // A one-cell ring cannot tell a full cell from a free one.
        let cells = (limits.max_queue_capacity as usize).max(2);
        (
            cells_offset,
            cells,
            cells_offset + cells * std::mem::size_of::<QueueCell>(),
        )
    } else {
        let entries = limits.max_history as usize;
        (
            tail_offset,
            entries,
            tail_offset + entries * std::mem::size_of::<AtomicU64>(),
        )
    };

    PortSlotLayout {
        stride: align_up(end, CACHE_LINE),
        ledger_header_offset,
        ledger_slots_offset,
        ledger_table_size,
        tail_offset,
        cells_offset,
        tail_len,
    }
}

impl SegmentLayout {
    /// Compute offsets for pools (sorted ascending) and port limits.
    pub fn compute(pools: &[PoolConfig], limits: &PortLimits) -> Result<Self, SharedMemoryError> {
        let mut sorted = pools.to_vec();
        sorted.sort_by_key(|pool| pool.chunk_size);

        let mut cursor = Cursor(0);
        cursor.reserve(std::mem::size_of::<SegmentHeader>(), CACHE_LINE)?;

        let mut pool_layouts = Vec::with_capacity(sorted.len());
        for pool in &sorted {
            let stride = chunk_stride(pool.chunk_size);
            let count = pool.chunk_count as usize;
            let header_offset = cursor.reserve(std::mem::size_of::<PoolHeader>(), CACHE_LINE)?;
            let next_offset =
                cursor.reserve(count * std::mem::size_of::<AtomicU32>(), CACHE_LINE)?;
            let chunks_bytes =
                stride
                    .checked_mul(count)
                    .ok_or(SharedMemoryError::SegmentTooLarge {
                        size: usize::MAX,
                        max: SharedMemoryRegion::MAX_SIZE,
                    })?;
            let chunks_offset = cursor.reserve(chunks_bytes, CACHE_LINE)?;
            pool_layouts.push(PoolLayout {
                chunk_size: pool.chunk_size,
                chunk_count: pool.chunk_count,
                stride,
                header_offset,
                next_offset,
                chunks_offset,
            });
        }

        let port_table_offset =
            cursor.reserve(std::mem::size_of::<PortTableHeader>(), CACHE_LINE)?;

        let publisher_slot = slot_layout(limits, false);
        let publishers_offset = cursor.reserve(
            publisher_slot.stride * limits.max_publishers as usize,
            CACHE_LINE,
        )?;

        let subscriber_slot = slot_layout(limits, true);
        let subscribers_offset = cursor.reserve(
            subscriber_slot.stride * limits.max_subscribers as usize,
            CACHE_LINE,
        )?;

        let total_size = align_up(cursor.0, PAGE_SIZE).max(SharedMemoryRegion::MIN_SIZE);
        if total_size > SharedMemoryRegion::MAX_SIZE {
            return Err(SharedMemoryError::SegmentTooLarge {
                size: total_size,
                max: SharedMemoryRegion::MAX_SIZE,
            });
        }

        Ok(Self {
            pools: pool_layouts,
            limits: *limits,
            port_table_offset,
            publishers_offset,
            publisher_slot,
            subscribers_offset,
            subscriber_slot,
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Vec<PoolConfig> {
        vec![
            PoolConfig {
                chunk_size: 1024,
                chunk_count: 4,
            },
            PoolConfig {
                chunk_size: 64,
                chunk_count: 16,
            },
        ]
    }

    #[test]
    fn test_layout_is_deterministic_and_sorted() {
        let limits = PortLimits::default();
        let a = SegmentLayout::compute(&pools(), &limits).unwrap();
        let b = SegmentLayout::compute(&pools(), &limits).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pools[0].chunk_size, 64);
        assert_eq!(a.pools[1].chunk_size, 1024);
        assert_eq!(a.total_size % PAGE_SIZE, 0);
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let layout = SegmentLayout::compute(&pools(), &PortLimits::default()).unwrap();
        let mut end = std::mem::size_of::<SegmentHeader>();
        for pool in &layout.pools {
            assert!(pool.header_offset >= end);
            assert!(pool.next_offset >= pool.header_offset + std::mem::size_of::<PoolHeader>());
            assert!(pool.chunks_offset >= pool.next_offset + 4 * pool.chunk_count as usize);
            assert_eq!(pool.chunks_offset % CACHE_LINE, 0);
            end = pool.chunks_offset + pool.stride * pool.chunk_count as usize;
        }
        assert!(layout.port_table_offset >= end);
        assert!(layout.subscribers_offset >= layout.publishers_offset);
        assert!(layout.total_size >= layout.subscribers_offset);
    }

    #[test]
    fn test_slot_sizes_follow_limits() {
        let limits = PortLimits {
            max_chunks_held: 5,
            max_queue_capacity: 10,
            max_history: 3,
            ..PortLimits::default()
        };
        let layout = SegmentLayout::compute(&pools(), &limits).unwrap();
        assert_eq!(layout.subscriber_slot.ledger_table_size, 16);
        assert_eq!(layout.subscriber_slot.tail_len, 10);
        assert_eq!(layout.publisher_slot.tail_len, 3);
        assert_eq!(layout.publisher_slot.stride % CACHE_LINE, 0);
    }

    #[test]
    fn test_oversized_segment_rejected() {
        let huge = vec![PoolConfig {
            chunk_size: 64 * 1024 * 1024,
            chunk_count: 1 << 10,
        }];
        assert!(matches!(
            SegmentLayout::compute(&huge, &PortLimits::default()),
            Err(SharedMemoryError::SegmentTooLarge { .. })
        ));
    }
}
