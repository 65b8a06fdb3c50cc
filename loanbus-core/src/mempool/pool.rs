// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One size class of fixed-size chunks with a lock-free free list.
//!
//! The free list is a Treiber stack over chunk indices. Its head packs a
//! 32-bit ABA tag next to the 32-bit index in one `AtomicU64`, and the
//! per-chunk `next` links live in a separate array so a chunk's header is
//! never touched while it sits on the list.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::chunk::ChunkHeader;

/// End-of-list marker for chunk indices.
const NIL: u32 = u32::MAX;

/// Pool bookkeeping in shared memory.
#[repr(C, align(64))]
pub struct PoolHeader {
    /// `tag << 32 | index` of the first free chunk.
    free_head: AtomicU64,
    used: AtomicU64,
    high_water: AtomicU64,
    chunk_size: AtomicU32,
    chunk_count: AtomicU32,
}

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Process-local view of one pool inside a mapped segment.
pub struct ChunkPool {
    index: u32,
    header: *const PoolHeader,
    next: *const AtomicU32,
    chunks: *mut u8,
    stride: usize,
    chunk_size: u32,
    chunk_count: u32,
}

// SAFETY: the view only points into the segment mapping, which outlives it,
// and all shared state behind the pointers is atomic.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Build a view over pool memory.
    ///
    /// # Safety
    /// `header`, `next` (`chunk_count` entries) and `chunks`
    /// (`chunk_count * stride` bytes) must stay mapped for the view's lifetime.
    pub(crate) unsafe fn from_raw(
        index: u32,
        header: *const PoolHeader,
        next: *const AtomicU32,
        chunks: *mut u8,
        stride: usize,
        chunk_size: u32,
        chunk_count: u32,
    ) -> Self {
        Self {
            index,
            header,
            next,
            chunks,
            stride,
            chunk_size,
            chunk_count,
        }
    }

    /// Link every chunk onto the free list. Creator only, before publication.
    pub(crate) fn format(&self) {
        let header = self.header();
        header.chunk_size.store(self.chunk_size, Ordering::Relaxed);
        header.chunk_count.store(self.chunk_count, Ordering::Relaxed);
        header.used.store(0, Ordering::Relaxed);
        header.high_water.store(0, Ordering::Relaxed);

        for i in 0..self.chunk_count {
            let chunk = self.chunk_header(i);
            chunk.ref_count.store(0, Ordering::Relaxed);
            chunk.pool_index.store(self.index, Ordering::Relaxed);
            chunk.chunk_index.store(i, Ordering::Relaxed);
            chunk.chunk_size.store(self.chunk_size, Ordering::Relaxed);

            let next = if i + 1 < self.chunk_count { i + 1 } else { NIL };
            self.next_link(i).store(next, Ordering::Relaxed);
        }

        header.free_head.store(pack(0, 0), Ordering::Release);
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: valid for the view's lifetime per from_raw's contract
        unsafe { &*self.header }
    }

    fn next_link(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.chunk_count);
        // SAFETY: index is in bounds of the next array
        unsafe { &*self.next.add(index as usize) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Payload capacity of each chunk.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn used(&self) -> u64 {
        self.header().used.load(Ordering::Acquire)
    }

    pub fn high_water(&self) -> u64 {
        self.header().high_water.load(Ordering::Acquire)
    }

    /// Free chunks according to the `used` counter.
    pub fn free(&self) -> u64 {
        (self.chunk_count as u64).saturating_sub(self.used())
    }

    /// Walk the free list and count its entries.
    ///
    /// Only meaningful while no other party is allocating or freeing.
    pub fn free_list_len(&self) -> u64 {
        let (_, mut index) = unpack(self.header().free_head.load(Ordering::Acquire));
        let mut count = 0u64;
        while index != NIL && count <= self.chunk_count as u64 {
            count += 1;
            index = self.next_link(index).load(Ordering::Acquire);
        }
        count
    }

    /// Address of a chunk's first byte.
    pub(crate) fn chunk_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.chunk_count);
        // SAFETY: index is in bounds, so the offset stays inside the pool
        unsafe { self.chunks.add(index as usize * self.stride) }
    }

    pub(crate) fn chunk_header(&self, index: u32) -> &ChunkHeader {
        // SAFETY: every chunk starts with a 64-byte aligned ChunkHeader
        unsafe { &*(self.chunk_ptr(index) as *const ChunkHeader) }
    }

    /// Pop a chunk index off the free list.
    pub(crate) fn pop(&self) -> Option<u32> {
        let head = &self.header().free_head;
        let mut current = head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(current);
            if index == NIL {
                return None;
            }
            let next = self.next_link(index).load(Ordering::Acquire);
            match head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let header = self.header();
                    let used = header.used.fetch_add(1, Ordering::AcqRel) + 1;
                    header.high_water.fetch_max(used, Ordering::AcqRel);
                    return Some(index);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Push a chunk index back onto the free list.
    pub(crate) fn push(&self, index: u32) {
        let head = &self.header().free_head;
        let mut current = head.load(Ordering::Acquire);
        loop {
            let (tag, first) = unpack(current);
            self.next_link(index).store(first, Ordering::Release);
            match head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.header().used.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
            used: self.used(),
            free: self.free(),
            high_water: self.high_water(),
        }
    }
}

/// Snapshot of one pool's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub used: u64,
    pub free: u64,
    pub high_water: u64,
}
