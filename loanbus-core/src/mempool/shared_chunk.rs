// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Reference-counted handle to a chunk.

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::chunk::{ChunkHeader, ChunkMetadata, ChunkRef};
use crate::shm::Segment;

/// Owns exactly one reference to a chunk.
///
/// `Clone` adds a reference and `Drop` releases one; the drop that takes
/// the count from 1 to 0 returns the chunk to its pool.
pub struct SharedChunk {
    segment: Arc<Segment>,
    chunk: ChunkRef,
}

impl SharedChunk {
    /// Wrap a reference the caller already owns (fresh allocation, queue or
    /// ledger entry). Returns `None` for the sentinel or a foreign reference.
    pub fn from_raw(segment: Arc<Segment>, chunk: ChunkRef) -> Option<Self> {
        if chunk.is_none() || segment.memory().header(chunk).is_none() {
            tracing::error!(chunk = ?chunk, "invalid chunk reference");
            return None;
        }
        Some(Self { segment, chunk })
    }

    /// Give up the handle without releasing; the reference now belongs to
    /// whichever shared structure stores the returned `ChunkRef`.
    pub fn into_raw(self) -> ChunkRef {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the Arc is moved out exactly once
        drop(unsafe { std::ptr::read(&this.segment) });
        this.chunk
    }

    pub fn chunk_ref(&self) -> ChunkRef {
        self.chunk
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub(crate) fn header(&self) -> &ChunkHeader {
        match self.segment.memory().header(self.chunk) {
            Some(header) => header,
            // from_raw rejects references outside the segment
            None => unreachable!("SharedChunk holds a validated reference"),
        }
    }

    pub fn ref_count(&self) -> u64 {
        self.header().ref_count.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.header().payload_size.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        match self.segment.memory().payload_ptr(self.chunk) {
            // SAFETY: the payload lies inside the chunk and stays valid while
            // this reference is held
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr, self.len()) },
            None => &[],
        }
    }

    /// Mutable payload access.
    ///
    /// # Safety
    /// The caller must be the only party able to reach the chunk, i.e. it
    /// has not been published or cloned.
    pub(crate) unsafe fn payload_mut(&mut self) -> &mut [u8] {
        match self.segment.memory().payload_ptr(self.chunk) {
            Some(ptr) => std::slice::from_raw_parts_mut(ptr, self.len()),
            None => &mut [],
        }
    }

    pub fn metadata(&self) -> ChunkMetadata {
        self.header().metadata()
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        self.header().ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            segment: Arc::clone(&self.segment),
            chunk: self.chunk,
        }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        self.segment.memory().release(self.chunk);
    }
}

impl fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChunk")
            .field("chunk", &self.chunk)
            .field("ref_count", &self.ref_count())
            .field("len", &self.len())
            .finish()
    }
}
