// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Chunk pool and chunk handles.
//!
//! Chunks are carved out of fixed-size classes inside a segment and handed
//! out as reference-counted `SharedChunk`s.

mod chunk;
mod manager;
mod pool;
mod shared_chunk;

pub use chunk::{
    align_up, chunk_stride, class_fits, ChunkHeader, ChunkMetadata, ChunkRef, CHUNK_ALIGNMENT,
    CHUNK_HEADER_SIZE, FLAG_CHECKSUM, MAX_PAYLOAD_ALIGNMENT,
};
pub use manager::MemoryManager;
pub use pool::{ChunkPool, PoolHeader, PoolStats};
pub use shared_chunk::SharedChunk;
