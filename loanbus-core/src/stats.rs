// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

use serde::{Deserialize, Serialize};

use crate::mempool::PoolStats;
use crate::port::{ClaimedPort, PortState, PortTable};
use crate::types::{PortKind, ServiceDescription};

/// Point-in-time view of a segment, shared with the CLI as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStats {
    pub name: String,
    pub total_size: usize,
    pub creator_pid: u32,
    pub topology_epoch: u64,
    pub pools: Vec<PoolStats>,
    pub ports: Vec<PortStats>,
}

impl SegmentStats {
    pub fn used_chunks(&self) -> u64 {
        self.pools.iter().map(|pool| pool.used).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStats {
    pub kind: PortKind,
    pub index: u32,
    pub generation: u32,
    pub state: PortState,
    pub owner_pid: u32,
    pub service: Option<String>,
    /// Loans (publisher) or samples (subscriber) currently held.
    pub held_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed_chunks: Option<u64>,
}

impl PortStats {
    /// Read the counters of a claimed slot. `None` if it is out of range.
    pub fn collect(table: &PortTable, port: ClaimedPort) -> Option<Self> {
        let id = port.id;
        let stats = match id.kind {
            PortKind::Publisher => {
                let slot = table.publisher(id.index)?;
                Self::base(port, slot.header.state(), slot.header.service(), slot.ledger.len())
                    .with_history(slot.history_len())
            }
            PortKind::Subscriber => {
                let slot = table.subscriber(id.index)?;
                let mut stats = Self::base(
                    port,
                    slot.header.state(),
                    slot.header.service(),
                    slot.ledger.len(),
                );
                stats.queue_len = Some(slot.queue.len());
                stats.queue_capacity = Some(slot.queue.capacity());
                stats.missed_chunks = Some(slot.queue.discarded());
                stats
            }
        };
        Some(stats)
    }

    fn base(
        port: ClaimedPort,
        state: PortState,
        service: Option<ServiceDescription>,
        held_chunks: usize,
    ) -> Self {
        Self {
            kind: port.id.kind,
            index: port.id.index,
            generation: port.id.generation,
            state,
            owner_pid: port.owner_pid,
            service: service.map(|service| service.to_string()),
            held_chunks,
            history_len: None,
            queue_len: None,
            queue_capacity: None,
            missed_chunks: None,
        }
    }

    fn with_history(mut self, history_len: usize) -> Self {
        self.history_len = Some(history_len);
        self
    }
}
