// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Used-chunk ledger.
//!
//! Every port records the chunks it currently holds (outstanding loans for
//! publishers, taken samples for subscribers) in a fixed-size table in
//! shared memory. If the owner dies, a survivor purges the table and
//! releases exactly those references.
//!
//! The table is open addressed with linear probing. An entry is inserted
//! or removed by one atomic operation on its slot, so a crash in the middle
//! of `track` or `untrack` never leaves a half-written entry behind: either
//! the reference is in the table (and purge releases it) or it is not.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::LedgerFull;
use crate::mempool::{ChunkRef, MemoryManager, SharedChunk};
use crate::types::unix_time_ns;

const EMPTY: u64 = u64::MAX;
const TOMBSTONE: u64 = u64::MAX - 1;

#[repr(C, align(64))]
#[derive(Default)]
pub struct LedgerHeader {
    capacity: AtomicU32,
    table_size: AtomicU32,
    len: AtomicU32,
    tombstones: AtomicU32,
}

#[repr(C)]
#[derive(Default)]
pub struct LedgerSlot {
    chunk: AtomicU64,
    acquired_at_ns: AtomicU64,
}

/// One held chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub chunk: ChunkRef,
    pub acquired_at_ns: u64,
}

/// View of a ledger living in shared memory.
#[derive(Clone, Copy)]
pub struct UsedChunkLedger<'a> {
    header: &'a LedgerHeader,
    slots: &'a [LedgerSlot],
}

impl<'a> UsedChunkLedger<'a> {
    /// `slots.len()` must be a power of two.
    pub fn new(header: &'a LedgerHeader, slots: &'a [LedgerSlot]) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        Self { header, slots }
    }

    /// Empty the table and set its capacity. Only valid while no other
    /// party uses the ledger.
    pub fn init(&self, capacity: u32) {
        let capacity = capacity.min(self.slots.len() as u32 / 2);
        for slot in self.slots {
            slot.chunk.store(EMPTY, Ordering::Relaxed);
            slot.acquired_at_ns.store(0, Ordering::Relaxed);
        }
        self.header
            .table_size
            .store(self.slots.len() as u32, Ordering::Relaxed);
        self.header.len.store(0, Ordering::Relaxed);
        self.header.tombstones.store(0, Ordering::Relaxed);
        self.header.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.header.capacity.load(Ordering::Acquire) as usize
    }

    pub fn len(&self) -> usize {
        self.header.len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Removed entries still marked in the table.
    pub fn tombstones(&self) -> usize {
        self.header.tombstones.load(Ordering::Acquire) as usize
    }

    fn home(&self, chunk: ChunkRef) -> usize {
        let hash = chunk.as_raw().wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        hash as usize & (self.slots.len() - 1)
    }

    /// Claim room for one entry.
    pub(crate) fn reserve(&self) -> Result<(), LedgerFull> {
        let capacity = self.header.capacity.load(Ordering::Acquire);
        self.header
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < capacity).then_some(len + 1)
            })
            .map(|_| ())
            .map_err(|_| LedgerFull {
                capacity: capacity as usize,
            })
    }

    /// Give back a reservation that was not used.
    pub(crate) fn cancel_reservation(&self) {
        self.decrement_len();
    }

    /// Store `chunk` under a reservation made by `reserve`.
    pub(crate) fn insert_reserved(&self, chunk: ChunkRef) {
        let mask = self.slots.len() - 1;
        let home = self.home(chunk);
        // A reservation guarantees a free slot; two laps cover slots freed by
        // concurrent removals during the first.
        for step in 0..2 * self.slots.len() {
            let slot = &self.slots[(home + step) & mask];
            let current = slot.chunk.load(Ordering::Acquire);
            if current != EMPTY && current != TOMBSTONE {
                continue;
            }
            if slot
                .chunk
                .compare_exchange(current, chunk.as_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.acquired_at_ns.store(unix_time_ns(), Ordering::Relaxed);
                if current == TOMBSTONE {
                    let _ = self.header.tombstones.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |count| count.checked_sub(1),
                    );
                }
                return;
            }
        }
        tracing::error!(chunk = %chunk, "ledger table has no free slot despite reservation");
        self.cancel_reservation();
    }

    /// Record a held chunk.
    pub fn track(&self, chunk: &SharedChunk) -> Result<(), LedgerFull> {
        self.reserve()?;
        self.insert_reserved(chunk.chunk_ref());
        Ok(())
    }

    /// Forget one entry for `chunk`. Returns `false` if none was recorded.
    pub fn untrack(&self, chunk: ChunkRef) -> bool {
        let raw = chunk.as_raw();
        let mask = self.slots.len() - 1;
        let home = self.home(chunk);

        for step in 0..self.slots.len() {
            let index = (home + step) & mask;
            let current = self.slots[index].chunk.load(Ordering::Acquire);
            if current == EMPTY {
                break;
            }
            if current == raw && self.remove(index, raw) {
                return true;
            }
        }

        // Tombstone sweeps can punch holes into a probe chain; fall back to
        // scanning the whole table.
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.chunk.load(Ordering::Acquire) == raw && self.remove(index, raw) {
                return true;
            }
        }
        false
    }

    fn remove(&self, index: usize, raw: u64) -> bool {
        let mask = self.slots.len() - 1;
        // The end of a probe chain needs no tombstone.
        let marker = if self.slots[(index + 1) & mask].chunk.load(Ordering::Acquire) == EMPTY {
            EMPTY
        } else {
            TOMBSTONE
        };
        if self.slots[index]
            .chunk
            .compare_exchange(raw, marker, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if marker == TOMBSTONE {
            let tombstones = self.header.tombstones.fetch_add(1, Ordering::AcqRel) + 1;
            if tombstones as usize > self.slots.len() / 4 {
                self.reset_tombstones();
            }
        }
        self.decrement_len();
        true
    }

    fn decrement_len(&self) {
        let previous = self.header.len.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.reset_tombstones();
        }
    }

    fn reset_tombstones(&self) {
        self.header.tombstones.store(0, Ordering::Release);
        for slot in self.slots {
            let _ = slot.chunk.compare_exchange(
                TOMBSTONE,
                EMPTY,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Release every recorded reference and empty the table.
    ///
    /// Used for the ledger of a port whose owner is gone.
    pub fn purge_all(&self, memory: &MemoryManager) -> usize {
        let mut released = 0;
        for slot in self.slots {
            let raw = slot.chunk.swap(EMPTY, Ordering::AcqRel);
            if raw == EMPTY || raw == TOMBSTONE {
                continue;
            }
            memory.release(ChunkRef::from_raw(raw));
            released += 1;
        }
        self.header.len.store(0, Ordering::Release);
        self.header.tombstones.store(0, Ordering::Release);
        released
    }

    /// Snapshot of the recorded entries.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let raw = slot.chunk.load(Ordering::Acquire);
                (raw != EMPTY && raw != TOMBSTONE).then(|| LedgerEntry {
                    chunk: ChunkRef::from_raw(raw),
                    acquired_at_ns: slot.acquired_at_ns.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    pub fn contains(&self, chunk: ChunkRef) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.chunk.load(Ordering::Acquire) == chunk.as_raw())
    }
}
