// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Chunk addressing and the in-memory chunk header.
//!
//! Chunks are named by location (pool index + chunk index) so a reference
//! stored in shared memory means the same chunk in every process, whatever
//! address the segment is mapped at.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::PortId;

/// Size of the header that precedes every payload.
pub const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

/// Largest payload alignment a loan may request.
pub const MAX_PAYLOAD_ALIGNMENT: usize = 4096;

/// Alignment of every chunk start inside a pool.
pub const CHUNK_ALIGNMENT: usize = 64;

/// Header flag: `checksum` holds a CRC32 of the payload.
pub const FLAG_CHECKSUM: u32 = 1;

const _: () = assert!(CHUNK_HEADER_SIZE == 128);

/// Relocatable reference to a chunk: `pool_index << 32 | chunk_index`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRef(u64);

impl ChunkRef {
    /// Sentinel for "no chunk" inside shared structures.
    pub const NONE: ChunkRef = ChunkRef(u64::MAX);

    pub const fn new(pool_index: u32, chunk_index: u32) -> Self {
        Self(((pool_index as u64) << 32) | chunk_index as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn pool_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn chunk_index(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ChunkRef(none)")
        } else {
            write!(f, "ChunkRef({}:{})", self.pool_index(), self.chunk_index())
        }
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool_index(), self.chunk_index())
    }
}

/// Header stored at the start of every chunk.
///
/// Every field is atomic because the header is read and written by several
/// processes. Only the refcount is contended; the rest is written by the
/// current exclusive owner (allocator or loaning publisher) and published
/// to readers by the queue's release/acquire handoff.
#[repr(C, align(64))]
pub struct ChunkHeader {
    pub ref_count: AtomicU64,
    pub pool_index: AtomicU32,
    pub chunk_index: AtomicU32,
    /// Payload capacity of this chunk's size class.
    pub chunk_size: AtomicU32,
    pub payload_size: AtomicU32,
    pub payload_alignment: AtomicU32,
    /// Payload start, relative to the chunk start.
    pub payload_offset: AtomicU32,
    pub origin_port: AtomicU64,
    pub sequence: AtomicU64,
    /// Nanoseconds since the UNIX epoch at publish.
    pub timestamp_ns: AtomicU64,
    pub type_hint: AtomicU64,
    pub checksum: AtomicU32,
    pub flags: AtomicU32,
}

impl ChunkHeader {
    /// Reset the per-loan fields after allocation.
    pub(crate) fn prepare(&self, payload_size: u32, payload_alignment: u32, payload_offset: u32) {
        self.payload_size.store(payload_size, Ordering::Relaxed);
        self.payload_alignment
            .store(payload_alignment, Ordering::Relaxed);
        self.payload_offset.store(payload_offset, Ordering::Relaxed);
        self.origin_port.store(u64::MAX, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Relaxed);
        self.timestamp_ns.store(0, Ordering::Relaxed);
        self.type_hint.store(0, Ordering::Relaxed);
        self.checksum.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.ref_count.store(1, Ordering::Release);
    }

    /// Snapshot of the descriptive fields.
    pub fn metadata(&self) -> ChunkMetadata {
        let origin = self.origin_port.load(Ordering::Acquire);
        let flags = self.flags.load(Ordering::Acquire);
        ChunkMetadata {
            chunk: ChunkRef::new(
                self.pool_index.load(Ordering::Relaxed),
                self.chunk_index.load(Ordering::Relaxed),
            ),
            chunk_size: self.chunk_size.load(Ordering::Relaxed),
            payload_size: self.payload_size.load(Ordering::Acquire),
            payload_alignment: self.payload_alignment.load(Ordering::Acquire),
            origin: (origin != u64::MAX).then(|| PortId::from_bits(origin)),
            sequence: self.sequence.load(Ordering::Acquire),
            timestamp_ns: self.timestamp_ns.load(Ordering::Acquire),
            type_hint: self.type_hint.load(Ordering::Acquire),
            checksum: (flags & FLAG_CHECKSUM != 0).then(|| self.checksum.load(Ordering::Acquire)),
        }
    }
}

/// Process-local copy of a chunk's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk: ChunkRef,
    pub chunk_size: u32,
    pub payload_size: u32,
    pub payload_alignment: u32,
    /// Publisher that published the chunk, if it has been published.
    pub origin: Option<PortId>,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub type_hint: u64,
    pub checksum: Option<u32>,
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes one chunk of `chunk_size` payload capacity occupies in its pool.
pub const fn chunk_stride(chunk_size: u32) -> usize {
    align_up(CHUNK_HEADER_SIZE + chunk_size as usize, CHUNK_ALIGNMENT)
}

/// Whether a class of `chunk_size` can hold `size` bytes at `alignment`.
///
/// Chunk starts are 64-byte aligned, so aligning the payload up costs at
/// most `alignment - 64` extra bytes.
pub fn class_fits(chunk_size: u32, size: usize, alignment: usize) -> bool {
    size.saturating_add(alignment.saturating_sub(CHUNK_ALIGNMENT)) <= chunk_size as usize
}

/// Payload offset for a chunk starting at `chunk_addr`.
///
/// Segments are page aligned and alignments are capped at a page, so the
/// result is the same in every process mapping the segment.
pub fn payload_offset(chunk_addr: usize, alignment: usize) -> usize {
    align_up(chunk_addr + CHUNK_HEADER_SIZE, alignment.max(1)) - chunk_addr
}
