//! Loanbus Core Library
//!
//! Zero-copy publish/subscribe over POSIX shared memory. Provides the
//! segment layout, fixed-size chunk pools, reference-counted chunk handles,
//! per-port used-chunk ledgers, lock-free inter-process queues with
//! overflow policies, and the publisher/subscriber facade on top.

pub mod config;
pub mod error;
pub mod ledger;
pub mod liveness;
pub mod mempool;
pub mod port;
pub mod queue;
pub mod shm;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, PoolConfig, PortLimits, SegmentConfig};
pub use error::{
    AllocationError, HardValidationError, LoanbusError, LoanbusResult, PortError, QueueFull,
    QueueFullReason, SharedMemoryError, TakeError,
};
pub use ledger::UsedChunkLedger;
pub use liveness::{LivenessOracle, PortReaper, ProcessLiveness, ReapReport};
pub use mempool::{ChunkMetadata, ChunkRef, MemoryManager, SharedChunk};
pub use port::{
    Loan, PublishChunk, PublishReport, Publisher, PublisherOptions, Sample, Subscriber,
    SubscriberOptions,
};
pub use queue::{ChunkQueue, OverflowPolicy, PushOutcome, QueueOptions};
pub use shm::Segment;
pub use stats::{PortStats, SegmentStats};
pub use types::{PortId, PortKind, ProcessId, ServiceDescription};
