// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates segment geometry and port options at boot-up time.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HardValidationError, LoanbusError, LoanbusResult, PortError};
use crate::port::{PublisherOptions, SubscriberOptions};
use crate::queue::{OverflowPolicy, QueueOptions};
use crate::shm::MAX_POOLS;

/// Smallest payload capacity a pool may be configured with.
pub const MIN_CHUNK_SIZE: u32 = 8;

/// Largest payload capacity a pool may be configured with (64 MiB).
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Largest chunk count of a single pool.
pub const MAX_CHUNK_COUNT: u32 = 1 << 24;

/// Upper bound for every port limit.
pub const MAX_PORT_LIMIT: u32 = 1024;

/// Upper bound for the block policy's timeout.
pub const MAX_BLOCK_TIMEOUT_MS: u64 = 60_000;

/// Raw segment section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawSegmentConfig {
    #[serde(default = "default_segment_name")]
    name: String,
    #[serde(default = "default_max_publishers")]
    max_publishers: u32,
    #[serde(default = "default_max_subscribers")]
    max_subscribers: u32,
    #[serde(default = "default_max_queue_capacity")]
    max_queue_capacity: u32,
    #[serde(default = "default_max_chunks_held")]
    max_chunks_held: u32,
    #[serde(default = "default_max_history")]
    max_history: u32,
}

fn default_segment_name() -> String {
    "loanbus".to_string()
}

fn default_max_publishers() -> u32 {
    16
}

fn default_max_subscribers() -> u32 {
    64
}

fn default_max_queue_capacity() -> u32 {
    256
}

fn default_max_chunks_held() -> u32 {
    64
}

fn default_max_history() -> u32 {
    16
}

impl Default for RawSegmentConfig {
    fn default() -> Self {
        Self {
            name: default_segment_name(),
            max_publishers: default_max_publishers(),
            max_subscribers: default_max_subscribers(),
            max_queue_capacity: default_max_queue_capacity(),
            max_chunks_held: default_max_chunks_held(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPoolConfig {
    chunk_size: u32,
    chunk_count: u32,
}

#[derive(Debug, Deserialize)]
struct RawPublisherConfig {
    #[serde(default = "default_history_capacity")]
    history_capacity: u32,
    #[serde(default = "default_max_loans")]
    max_loans: u32,
    #[serde(default)]
    type_hint: u64,
    #[serde(default)]
    checksum: bool,
}

fn default_history_capacity() -> u32 {
    1
}

fn default_max_loans() -> u32 {
    8
}

impl Default for RawPublisherConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            max_loans: default_max_loans(),
            type_hint: 0,
            checksum: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSubscriberConfig {
    #[serde(default = "default_queue_capacity")]
    queue_capacity: u32,
    #[serde(default = "default_overflow_policy")]
    overflow_policy: OverflowPolicy,
    #[serde(default = "default_block_timeout_ms")]
    block_timeout_ms: u64,
    #[serde(default = "default_subscriber_chunks_held")]
    max_chunks_held: u32,
    #[serde(default)]
    history_request: u32,
}

fn default_queue_capacity() -> u32 {
    16
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::DiscardOldest
}

fn default_block_timeout_ms() -> u64 {
    100
}

fn default_subscriber_chunks_held() -> u32 {
    16
}

impl Default for RawSubscriberConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: default_overflow_policy(),
            block_timeout_ms: default_block_timeout_ms(),
            max_chunks_held: default_subscriber_chunks_held(),
            history_request: 0,
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    segment: RawSegmentConfig,
    pools: Vec<RawPoolConfig>,
    #[serde(default)]
    publisher: RawPublisherConfig,
    #[serde(default)]
    subscriber: RawSubscriberConfig,
}

/// One size class of the chunk pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Payload capacity of each chunk in bytes.
    pub chunk_size: u32,
    pub chunk_count: u32,
}

/// Per-segment ceilings for port resources. Fixed when the segment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLimits {
    pub max_publishers: u32,
    pub max_subscribers: u32,
    pub max_queue_capacity: u32,
    /// Ledger capacity ceiling per port (held samples or outstanding loans).
    pub max_chunks_held: u32,
    pub max_history: u32,
}

impl Default for PortLimits {
    fn default() -> Self {
        Self {
            max_publishers: default_max_publishers(),
            max_subscribers: default_max_subscribers(),
            max_queue_capacity: default_max_queue_capacity(),
            max_chunks_held: default_max_chunks_held(),
            max_history: default_max_history(),
        }
    }
}

/// Validated description of a segment to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    /// Size classes, ascending by chunk size once validated.
    pub pools: Vec<PoolConfig>,
    pub limits: PortLimits,
}

impl SegmentConfig {
    /// Start a config with default limits and no pools.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pools: Vec::new(),
            limits: PortLimits::default(),
        }
    }

    pub fn with_pool(mut self, chunk_size: u32, chunk_count: u32) -> Self {
        self.pools.push(PoolConfig {
            chunk_size,
            chunk_count,
        });
        self
    }

    pub fn with_limits(mut self, limits: PortLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Check every field and sort the pools ascending.
    pub fn validate(&mut self) -> Result<(), HardValidationError> {
        if self.name.is_empty() || self.name.contains('/') || self.name.len() > 200 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "segment.name",
                value: self.name.clone(),
                reason: "Segment name must be 1-200 characters without '/'".to_string(),
            });
        }

        if self.pools.is_empty() {
            return Err(HardValidationError::SchemaValidation {
                message: "At least one pool must be defined".to_string(),
            });
        }

        if self.pools.len() > MAX_POOLS {
            return Err(HardValidationError::SchemaValidation {
                message: format!(
                    "At most {} pools may be defined, found {}",
                    MAX_POOLS,
                    self.pools.len()
                ),
            });
        }

        let mut seen_sizes = HashSet::new();
        for pool in &self.pools {
            if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&pool.chunk_size) {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "pools.chunk_size",
                    value: pool.chunk_size.to_string(),
                    reason: format!(
                        "Chunk size must be between {} and {} bytes",
                        MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
                    ),
                });
            }
            if pool.chunk_count == 0 || pool.chunk_count > MAX_CHUNK_COUNT {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "pools.chunk_count",
                    value: pool.chunk_count.to_string(),
                    reason: format!("Chunk count must be between 1 and {}", MAX_CHUNK_COUNT),
                });
            }
            if !seen_sizes.insert(pool.chunk_size) {
                return Err(HardValidationError::DuplicateChunkSize {
                    chunk_size: pool.chunk_size,
                });
            }
        }
        self.pools.sort_by_key(|pool| pool.chunk_size);

        let limits = [
            ("segment.max_publishers", self.limits.max_publishers, 1),
            ("segment.max_subscribers", self.limits.max_subscribers, 1),
            ("segment.max_queue_capacity", self.limits.max_queue_capacity, 1),
            ("segment.max_chunks_held", self.limits.max_chunks_held, 1),
            ("segment.max_history", self.limits.max_history, 0),
        ];
        for (field, value, min) in limits {
            if value < min || value > MAX_PORT_LIMIT {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: value.to_string(),
                    reason: format!("Must be between {} and {}", min, MAX_PORT_LIMIT),
                });
            }
        }

        Ok(())
    }

    /// Total payload bytes across all pools.
    pub fn payload_bytes(&self) -> u64 {
        self.pools
            .iter()
            .map(|pool| pool.chunk_size as u64 * pool.chunk_count as u64)
            .sum()
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub segment: SegmentConfig,
    pub publisher: PublisherOptions,
    pub subscriber: SubscriberOptions,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> LoanbusResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LoanbusError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| LoanbusError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> LoanbusResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| LoanbusError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> LoanbusResult<Config> {
        let mut segment = SegmentConfig {
            name: raw.segment.name,
            pools: raw
                .pools
                .into_iter()
                .map(|pool| PoolConfig {
                    chunk_size: pool.chunk_size,
                    chunk_count: pool.chunk_count,
                })
                .collect(),
            limits: PortLimits {
                max_publishers: raw.segment.max_publishers,
                max_subscribers: raw.segment.max_subscribers,
                max_queue_capacity: raw.segment.max_queue_capacity,
                max_chunks_held: raw.segment.max_chunks_held,
                max_history: raw.segment.max_history,
            },
        };
        segment.validate()?;

        let publisher = PublisherOptions {
            history_capacity: raw.publisher.history_capacity,
            max_loans: raw.publisher.max_loans,
            type_hint: raw.publisher.type_hint,
            checksum: raw.publisher.checksum,
        };
        publisher
            .validate(&segment.limits)
            .map_err(Self::port_option_error)?;

        let subscriber = SubscriberOptions {
            queue: QueueOptions {
                capacity: raw.subscriber.queue_capacity,
                overflow_policy: raw.subscriber.overflow_policy,
                block_timeout: Duration::from_millis(raw.subscriber.block_timeout_ms),
            },
            max_chunks_held: raw.subscriber.max_chunks_held,
            history_request: raw.subscriber.history_request,
        };
        subscriber
            .validate(&segment.limits)
            .map_err(Self::port_option_error)?;

        Ok(Config {
            segment,
            publisher,
            subscriber,
        })
    }

    fn port_option_error(err: PortError) -> LoanbusError {
        match err {
            PortError::InvalidOption {
                field,
                value,
                reason,
            } => HardValidationError::InvalidFieldValue {
                field,
                value: value.to_string(),
                reason,
            }
            .into(),
            other => other.into(),
        }
    }
}
