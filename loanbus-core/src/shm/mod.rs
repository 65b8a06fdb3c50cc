// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared Memory module.
//!
//! POSIX shared memory mappings, the segment layout that places pools and
//! ports inside one mapping, and futex helpers for cross-process waiting.

pub mod futex;
mod layout;
mod region;
mod segment;

pub use layout::{
    PoolLayout, PortSlotLayout, SegmentHeader, SegmentLayout, MAX_POOLS, SEGMENT_MAGIC,
    SEGMENT_VERSION,
};
pub use region::SharedMemoryRegion;
pub use segment::Segment;
