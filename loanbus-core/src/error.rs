//! Custom error types for loanbus.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::mempool::SharedChunk;

/// Top-level error type for loanbus.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum LoanbusError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Shared Memory Errors
    // =========================================================================
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    // =========================================================================
    // Chunk Lifecycle Errors - Recoverable, Surfaced to the Caller
    // =========================================================================
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Queue full: {0}")]
    QueueFull(QueueFullReason),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerFull),

    #[error("Take error: {0}")]
    Take(#[from] TakeError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl From<QueueFull> for LoanbusError {
    fn from(err: QueueFull) -> Self {
        // The rejected chunk is released here.
        Self::QueueFull(err.reason)
    }
}

/// Hard validation errors for configuration and validated newtypes.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid service description: {value} - {reason}")]
    InvalidServiceDescription { value: String, reason: String },

    #[error("Duplicate chunk size in pool configuration: {chunk_size}")]
    DuplicateChunkSize { chunk_size: u32 },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Shared memory errors - mapping and layout failures.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    #[error("Failed to create shared memory region: {name} - {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to open shared memory region: {name} - {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Failed to map shared memory: {reason}")]
    MapFailed { reason: String },

    #[error("Failed to unlink shared memory region: {name} - {reason}")]
    UnlinkFailed { name: String, reason: String },

    #[error("Segment header mismatch: {reason}")]
    LayoutMismatch { reason: String },

    #[error("Segment too large: {size} bytes (max: {max})")]
    SegmentTooLarge { size: usize, max: usize },
}

/// Errors returned by the chunk pool when a loan cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("Pool exhausted: no free chunk can hold {size} bytes")]
    PoolExhausted { size: usize },

    #[error("Requested size {size} exceeds the largest configured chunk ({max} bytes)")]
    SizeExceedsConfiguredMax { size: usize, max: usize },

    #[error("Invalid payload alignment {alignment}: must be a power of two <= {max}")]
    InvalidAlignment { alignment: usize, max: usize },

    #[error("Too many outstanding loans: limit is {limit}")]
    TooManyLoans { limit: usize },
}

/// Why a queue refused a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullReason {
    /// Reject policy, or a non-waiting attempt under the block policy.
    Full,
    /// Block policy gave up after its timeout.
    Timeout,
    /// The receiving port went away while the push waited.
    Disconnected,
}

impl fmt::Display for QueueFullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "queue at capacity"),
            Self::Timeout => write!(f, "timed out waiting for queue space"),
            Self::Disconnected => write!(f, "receiver disconnected"),
        }
    }
}

/// A push that did not enqueue.
///
/// Carries the rejected chunk back to the caller; dropping the error
/// releases that reference.
#[derive(Error)]
#[error("Queue full: {reason}")]
pub struct QueueFull {
    pub reason: QueueFullReason,
    pub chunk: SharedChunk,
}

impl fmt::Debug for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFull")
            .field("reason", &self.reason)
            .field("chunk", &self.chunk.chunk_ref())
            .finish()
    }
}

/// The used-chunk ledger is at its configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Ledger full: {capacity} chunks already held")]
pub struct LedgerFull {
    pub capacity: usize,
}

/// Errors surfaced by `Subscriber::take`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TakeError {
    #[error("Too many chunks held in parallel: limit is {capacity}")]
    LedgerFull { capacity: usize },
}

impl From<LedgerFull> for TakeError {
    fn from(err: LedgerFull) -> Self {
        Self::LedgerFull {
            capacity: err.capacity,
        }
    }
}

/// Errors from claiming or operating on publisher/subscriber ports.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free {kind} port in segment (max: {max})")]
    NoFreeSlot { kind: &'static str, max: usize },

    #[error("Invalid port option: {field} = {value} - {reason}")]
    InvalidOption {
        field: &'static str,
        value: u64,
        reason: String,
    },
}

/// Result type alias using LoanbusError.
pub type LoanbusResult<T> = Result<T, LoanbusError>;
