// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Segment - one shared mapping holding pools, chunks and the port table.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::layout::{SegmentHeader, SegmentLayout};
use super::region::SharedMemoryRegion;
use crate::config::{PortLimits, SegmentConfig};
use crate::error::{AllocationError, LoanbusResult, SharedMemoryError};
use crate::mempool::{MemoryManager, SharedChunk};
use crate::port::PortTable;
use crate::stats::{PortStats, SegmentStats};

/// A mapped segment.
///
/// Shared between handles and ports through `Arc`; the mapping lives as long
/// as the last handle. Dropping the creator of a named segment unlinks it.
pub struct Segment {
    memory: MemoryManager,
    ports: PortTable,
    layout: SegmentLayout,
    region: SharedMemoryRegion,
}

impl Segment {
    /// Create and initialize a named segment.
    pub fn create(config: &SegmentConfig) -> LoanbusResult<Arc<Self>> {
        let mut config = config.clone();
        config.validate()?;
        let layout = SegmentLayout::compute(&config.pools, &config.limits)?;
        let region = SharedMemoryRegion::create(&config.name, layout.total_size)?;
        Ok(Arc::new(Self::format(region, layout)))
    }

    /// Create an anonymous segment, shared with threads of this process and
    /// children forked afterwards.
    pub fn anonymous(config: &SegmentConfig) -> LoanbusResult<Arc<Self>> {
        let mut config = config.clone();
        config.validate()?;
        let layout = SegmentLayout::compute(&config.pools, &config.limits)?;
        let region = SharedMemoryRegion::anonymous(layout.total_size)?;
        Ok(Arc::new(Self::format(region, layout)))
    }

    /// Map a segment created by another process.
    pub fn open(name: &str) -> LoanbusResult<Arc<Self>> {
        let region = SharedMemoryRegion::open(name)?;
        if region.size() < std::mem::size_of::<SegmentHeader>() {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!("region of {} bytes is too small", region.size()),
            }
            .into());
        }

        // SAFETY: the region is at least one header long and page aligned
        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        let layout = header.read()?;
        if layout.total_size > region.size() {
            return Err(SharedMemoryError::LayoutMismatch {
                reason: format!(
                    "segment needs {} bytes but region has {}",
                    layout.total_size,
                    region.size()
                ),
            }
            .into());
        }

        let base = region.as_ptr();
        // SAFETY: the region covers layout.total_size bytes and is owned by
        // the returned segment
        let (memory, ports) = unsafe {
            (
                MemoryManager::from_layout(base, &layout),
                PortTable::from_layout(base, &layout),
            )
        };

        tracing::debug!(name = %name, size = layout.total_size, "Opened segment");

        Ok(Arc::new(Self {
            memory,
            ports,
            layout,
            region,
        }))
    }

    /// Remove a named segment. Processes that have it mapped keep using it.
    pub fn unlink(name: &str) -> LoanbusResult<()> {
        SharedMemoryRegion::unlink(name)?;
        Ok(())
    }

    fn format(region: SharedMemoryRegion, layout: SegmentLayout) -> Self {
        let base = region.as_ptr();
        // SAFETY: the region was just created with layout.total_size bytes
        let (header, memory, ports) = unsafe {
            (
                &*(base as *const SegmentHeader),
                MemoryManager::from_layout(base, &layout),
                PortTable::from_layout(base, &layout),
            )
        };

        header.write(&layout);
        memory.format();
        ports.format();
        header.publish();

        tracing::debug!(
            name = %region.name(),
            size = layout.total_size,
            pools = layout.pools.len(),
            "Created segment"
        );

        Self {
            memory,
            ports,
            layout,
            region,
        }
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: validated at create/open time
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    /// Name of the shared memory object (empty for anonymous segments).
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn size(&self) -> usize {
        self.layout.total_size
    }

    pub fn creator_pid(&self) -> u32 {
        self.header().creator_pid.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> &PortLimits {
        &self.layout.limits
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Loan a chunk able to hold `size` bytes aligned to `alignment`.
    pub fn allocate(
        self: &Arc<Self>,
        size: usize,
        alignment: usize,
    ) -> Result<SharedChunk, AllocationError> {
        let chunk = self.memory.allocate(size, alignment)?;
        SharedChunk::from_raw(Arc::clone(self), chunk).ok_or(AllocationError::PoolExhausted { size })
    }

    /// Snapshot of pool and port counters.
    pub fn stats(&self) -> SegmentStats {
        let ports = self.ports.claimed_ports();
        SegmentStats {
            name: self.name().to_string(),
            total_size: self.layout.total_size,
            creator_pid: self.creator_pid(),
            topology_epoch: self.ports.epoch(),
            pools: self.memory.stats(),
            ports: ports
                .into_iter()
                .filter_map(|port| PortStats::collect(&self.ports, port))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoanbusError;

    fn config(name: &str) -> SegmentConfig {
        SegmentConfig::new(name)
            .with_pool(64, 8)
            .with_pool(4096, 2)
    }

    #[test]
    fn test_anonymous_segment_pools() {
        let segment = Segment::anonymous(&config("anon")).unwrap();
        assert_eq!(segment.memory().pools().len(), 2);
        assert_eq!(segment.memory().total_chunks(), 10);
        assert_eq!(segment.memory().used_chunks(), 0);
        assert_eq!(segment.memory().max_chunk_size(), 4096);
        assert_eq!(segment.creator_pid(), std::process::id());
        assert!(segment.name().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Segment::anonymous(&SegmentConfig::new("empty"));
        assert!(matches!(result, Err(LoanbusError::HardValidation(_))));
    }

    #[test]
    fn test_named_segment_open_shares_memory() {
        let name = format!("loanbus-segment-test-{}", std::process::id());
        let creator = Segment::create(&config(&name)).unwrap();
        let opener = Segment::open(&name).unwrap();
        assert_eq!(opener.layout(), creator.layout());

        let chunk = creator.allocate(32, 8).unwrap();
        assert_eq!(opener.memory().used_chunks(), 1);
        drop(chunk);
        assert_eq!(opener.memory().used_chunks(), 0);
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let name = format!("loanbus-missing-{}", std::process::id());
        assert!(Segment::open(&name).is_err());
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let config = SegmentConfig::new("exhaust").with_pool(64, 2);
        let segment = Segment::anonymous(&config).unwrap();
        let a = segment.allocate(8, 8).unwrap();
        let _b = segment.allocate(8, 8).unwrap();
        assert_eq!(
            segment.allocate(8, 8).unwrap_err(),
            AllocationError::PoolExhausted { size: 8 }
        );
        drop(a);
        assert!(segment.allocate(8, 8).is_ok());
    }
}
