// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Size-class allocator over the pools of one segment.

use std::sync::atomic::{AtomicU32, Ordering};

use super::chunk::{class_fits, payload_offset, ChunkHeader, ChunkRef, MAX_PAYLOAD_ALIGNMENT};
use super::pool::{ChunkPool, PoolHeader, PoolStats};
use crate::error::AllocationError;
use crate::shm::SegmentLayout;

/// Allocates chunks from the smallest fitting size class and returns them
/// when their reference count drops to zero.
pub struct MemoryManager {
    /// Ascending by chunk size.
    pools: Vec<ChunkPool>,
}

impl MemoryManager {
    /// Build pool views for a mapped segment.
    ///
    /// # Safety
    /// `base` must point to a mapping of at least `layout.total_size` bytes
    /// that outlives the returned manager.
    pub(crate) unsafe fn from_layout(base: *mut u8, layout: &SegmentLayout) -> Self {
        let pools = layout
            .pools
            .iter()
            .enumerate()
            .map(|(index, pool)| {
                ChunkPool::from_raw(
                    index as u32,
                    base.add(pool.header_offset) as *const PoolHeader,
                    base.add(pool.next_offset) as *const AtomicU32,
                    base.add(pool.chunks_offset),
                    pool.stride,
                    pool.chunk_size,
                    pool.chunk_count,
                )
            })
            .collect();
        Self { pools }
    }

    /// Initialize every pool's free list. Creator only.
    pub(crate) fn format(&self) {
        for pool in &self.pools {
            pool.format();
        }
    }

    pub fn pools(&self) -> &[ChunkPool] {
        &self.pools
    }

    /// Largest payload any class can hold.
    pub fn max_chunk_size(&self) -> u32 {
        self.pools.last().map_or(0, |pool| pool.chunk_size())
    }

    /// Take a chunk that can hold `size` bytes aligned to `alignment`.
    ///
    /// The chunk comes back with a reference count of 1 owned by the caller.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<ChunkRef, AllocationError> {
        if !alignment.is_power_of_two() || alignment > MAX_PAYLOAD_ALIGNMENT {
            return Err(AllocationError::InvalidAlignment {
                alignment,
                max: MAX_PAYLOAD_ALIGNMENT,
            });
        }

        let mut fitting = self
            .pools
            .iter()
            .filter(|pool| class_fits(pool.chunk_size(), size, alignment))
            .peekable();

        if fitting.peek().is_none() {
            return Err(AllocationError::SizeExceedsConfiguredMax {
                size,
                max: self.max_chunk_size() as usize,
            });
        }

        for pool in fitting {
            if let Some(index) = pool.pop() {
                let offset = payload_offset(pool.chunk_ptr(index) as usize, alignment);
                pool.chunk_header(index)
                    .prepare(size as u32, alignment as u32, offset as u32);
                return Ok(ChunkRef::new(pool.index(), index));
            }
        }

        Err(AllocationError::PoolExhausted { size })
    }

    fn locate(&self, chunk: ChunkRef) -> Option<(&ChunkPool, u32)> {
        let pool = self.pools.get(chunk.pool_index() as usize)?;
        (chunk.chunk_index() < pool.chunk_count()).then_some((pool, chunk.chunk_index()))
    }

    /// Header of a chunk, or `None` for a reference outside this segment.
    pub fn header(&self, chunk: ChunkRef) -> Option<&ChunkHeader> {
        self.locate(chunk)
            .map(|(pool, index)| pool.chunk_header(index))
    }

    /// Start of a chunk's payload.
    pub(crate) fn payload_ptr(&self, chunk: ChunkRef) -> Option<*mut u8> {
        let (pool, index) = self.locate(chunk)?;
        let offset = pool
            .chunk_header(index)
            .payload_offset
            .load(Ordering::Acquire);
        // SAFETY: the offset was computed inside the chunk's stride at allocation
        Some(unsafe { pool.chunk_ptr(index).add(offset as usize) })
    }

    /// Add a reference to a live chunk.
    pub fn retain(&self, chunk: ChunkRef) -> bool {
        match self.header(chunk) {
            Some(header) => {
                header.ref_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                tracing::error!(chunk = ?chunk, "retain of chunk outside segment");
                false
            }
        }
    }

    /// Drop one reference. Returns `true` if this call freed the chunk.
    ///
    /// The count never goes below zero: a release of an unreferenced chunk
    /// is logged and ignored.
    pub fn release(&self, chunk: ChunkRef) -> bool {
        let Some((pool, index)) = self.locate(chunk) else {
            tracing::error!(chunk = ?chunk, "release of chunk outside segment");
            return false;
        };

        let ref_count = &pool.chunk_header(index).ref_count;
        let mut current = ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                tracing::error!(chunk = %chunk, "refcount underflow; release ignored");
                return false;
            }
            match ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        if current == 1 {
            self.free(pool, index);
            true
        } else {
            false
        }
    }

    fn free(&self, pool: &ChunkPool, index: u32) {
        pool.push(index);
    }

    pub fn total_chunks(&self) -> u64 {
        self.pools.iter().map(|pool| pool.chunk_count() as u64).sum()
    }

    pub fn used_chunks(&self) -> u64 {
        self.pools.iter().map(|pool| pool.used()).sum()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(ChunkPool::stats).collect()
    }
}
