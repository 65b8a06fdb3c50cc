// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Dead-peer detection and port reclamation.
//!
//! A process that dies holding ports leaves its slots claimed, its loans
//! and samples tracked in ledgers and its queue full of references. The
//! reaper, run by any surviving process, asks a liveness oracle about each
//! claimed port's owner and reclaims the ports of dead owners.

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::shm::Segment;
use crate::types::{PortKind, ProcessId};

/// Answers whether a process still exists.
pub trait LivenessOracle {
    fn is_alive(&self, pid: ProcessId) -> bool;
}

impl<F> LivenessOracle for F
where
    F: Fn(ProcessId) -> bool,
{
    fn is_alive(&self, pid: ProcessId) -> bool {
        self(pid)
    }
}

/// Probes the OS process table with signal 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl LivenessOracle for ProcessLiveness {
    fn is_alive(&self, pid: ProcessId) -> bool {
        match kill(Pid::from_raw(pid.value() as i32), None) {
            Ok(()) => true,
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                tracing::warn!(pid = %pid, error = %e, "liveness probe failed; assuming alive");
                true
            }
        }
    }
}

/// What one reaper pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub publishers_reclaimed: usize,
    pub subscribers_reclaimed: usize,
    pub chunks_released: usize,
}

impl ReapReport {
    pub fn ports_reclaimed(&self) -> usize {
        self.publishers_reclaimed + self.subscribers_reclaimed
    }
}

/// Reclaims ports whose owners are gone.
pub struct PortReaper {
    segment: Arc<Segment>,
}

impl PortReaper {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self { segment }
    }

    /// One pass over the port table.
    pub fn reap(&self, oracle: &dyn LivenessOracle) -> ReapReport {
        let ports = self.segment.ports();
        let memory = self.segment.memory();
        let reaper = ProcessId::current();
        let mut report = ReapReport::default();

        for claimed in ports.claimed_ports() {
            // Freed between the scan and now.
            let Ok(owner) = ProcessId::new(claimed.owner_pid) else {
                continue;
            };
            if oracle.is_alive(owner) {
                continue;
            }

            let id = claimed.id;
            let Some(released) = ports.reap(memory, claimed, reaper) else {
                continue;
            };

            match id.kind {
                PortKind::Publisher => report.publishers_reclaimed += 1,
                PortKind::Subscriber => report.subscribers_reclaimed += 1,
            }
            report.chunks_released += released;
            tracing::warn!(
                port = %id,
                owner = %owner,
                state = ?claimed.state,
                released,
                "reclaimed port of dead process"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::port::{PortState, Publisher, PublisherOptions, Subscriber, SubscriberOptions};
    use crate::types::ServiceDescription;

    fn service() -> ServiceDescription {
        ServiceDescription::new("Lidar", "Roof", "Sweep").unwrap()
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(ProcessLiveness.is_alive(ProcessId::current()));
    }

    #[test]
    fn test_exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = ProcessId::new(child.id()).unwrap();
        child.wait().unwrap();
        assert!(!ProcessLiveness.is_alive(pid));
    }

    #[test]
    fn test_closure_oracle() {
        let oracle = |pid: ProcessId| pid.value() != 7;
        assert!(oracle.is_alive(ProcessId::new(1).unwrap()));
        assert!(!LivenessOracle::is_alive(&oracle, ProcessId::new(7).unwrap()));
    }

    #[test]
    fn test_reaper_finishes_abandoned_teardown() {
        let config = SegmentConfig::new("reaper-abandoned").with_pool(64, 16);
        let segment = Segment::anonymous(&config).unwrap();
        let publisher = Publisher::new(
            Arc::clone(&segment),
            service(),
            PublisherOptions {
                history_capacity: 0,
                ..PublisherOptions::default()
            },
        )
        .unwrap();
        let subscriber =
            Subscriber::new(Arc::clone(&segment), service(), SubscriberOptions::default())
                .unwrap();
        subscriber.subscribe();
        publisher.offer();
        publisher.publish_copy_of(&1u32).unwrap();
        publisher.publish_copy_of(&2u32).unwrap();
        drop(publisher);

        std::mem::forget(subscriber.take().unwrap().unwrap());
        let id = subscriber.id();
        std::mem::forget(subscriber);
        // The owner died right after it started tearing its port down.
        let slot = segment.ports().subscriber_slot(id.index);
        assert!(slot
            .header
            .transition(id.generation, PortState::Active, PortState::Reclaiming));
        assert_eq!(segment.memory().used_chunks(), 2);

        let stalled = segment.ports().claimed_ports();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].state, PortState::Reclaiming);

        let report = PortReaper::new(Arc::clone(&segment)).reap(&|_: ProcessId| false);
        assert_eq!(report.subscribers_reclaimed, 1);
        assert_eq!(report.chunks_released, 2);
        assert_eq!(segment.memory().used_chunks(), 0);
        assert!(segment.ports().claimed_ports().is_empty());

        let again =
            Subscriber::new(Arc::clone(&segment), service(), SubscriberOptions::default())
                .unwrap();
        assert_eq!(again.id().index, id.index);
        assert_eq!(again.id().generation, id.generation + 1);
    }

    #[test]
    fn test_reaper_skips_slot_with_live_claimer() {
        let config = SegmentConfig::new("reaper-live").with_pool(64, 4);
        let segment = Segment::anonymous(&config).unwrap();
        let subscriber =
            Subscriber::new(Arc::clone(&segment), service(), SubscriberOptions::default())
                .unwrap();
        let id = subscriber.id();
        let slot = segment.ports().subscriber_slot(id.index);
        assert!(slot
            .header
            .transition(id.generation, PortState::Idle, PortState::Reclaiming));

        let report = PortReaper::new(Arc::clone(&segment)).reap(&ProcessLiveness);
        assert_eq!(report, ReapReport::default());
        assert_eq!(segment.ports().claimed_ports().len(), 1);

        assert!(slot
            .header
            .transition(id.generation, PortState::Reclaiming, PortState::Idle));
    }
}
