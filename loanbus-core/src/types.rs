// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum length of one part of a service description.
pub const SERVICE_ID_MAX_LEN: usize = 64;

/// One validated part of a service description (service, instance or event).
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdString(String);

impl IdString {
    /// Create a new IdString with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "service_id",
                value: id,
                reason: "Identifier cannot be empty".to_string(),
            });
        }

        if id.len() > SERVICE_ID_MAX_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "service_id",
                value: id.clone(),
                reason: format!(
                    "Identifier too long: {} bytes (max {})",
                    id.len(),
                    SERVICE_ID_MAX_LEN
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "service_id",
                value: id,
                reason: "Identifier must contain only ASCII alphanumerics, hyphens, and underscores"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for IdString {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdString> for String {
    fn from(id: IdString) -> Self {
        id.0
    }
}

/// Three-part service identifier publishers and subscribers match on,
/// e.g. `Radar/FrontLeft/Object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub service: IdString,
    pub instance: IdString,
    pub event: IdString,
}

impl ServiceDescription {
    /// Create a new ServiceDescription, validating every part.
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        event: impl Into<String>,
    ) -> Result<Self, HardValidationError> {
        Ok(Self {
            service: IdString::new(service)?,
            instance: IdString::new(instance)?,
            event: IdString::new(event)?,
        })
    }

    /// Parse the `service/instance/event` form.
    pub fn parse(value: &str) -> Result<Self, HardValidationError> {
        let parts: Vec<&str> = value.split('/').collect();
        if parts.len() != 3 {
            return Err(HardValidationError::InvalidServiceDescription {
                value: value.to_string(),
                reason: format!("Expected 3 '/'-separated parts, found {}", parts.len()),
            });
        }
        Self::new(parts[0], parts[1], parts[2]).map_err(|e| {
            HardValidationError::InvalidServiceDescription {
                value: value.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// The three parts in order.
    pub fn parts(&self) -> [&str; 3] {
        [
            self.service.as_str(),
            self.instance.as_str(),
            self.event.as_str(),
        ]
    }
}

impl fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

/// Validated process ID.
/// Must be positive (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, HardValidationError> {
        if pid == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: "0".to_string(),
                reason: "Process ID 0 is reserved".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// The calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

/// Nanoseconds since the UNIX epoch, 0 if the clock is before it.
pub fn unix_time_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

/// Whether a port publishes or subscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Publisher,
    Subscriber,
}

impl PortKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

/// Identity of a port slot in a segment's port table.
///
/// The generation distinguishes successive owners of the same slot, so a
/// stale id never matches a reclaimed and re-claimed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortId {
    pub kind: PortKind,
    pub index: u32,
    pub generation: u32,
}

impl PortId {
    /// Pack into the 64-bit form stored in chunk headers.
    pub fn to_bits(self) -> u64 {
        let kind_bit = match self.kind {
            PortKind::Publisher => 0,
            PortKind::Subscriber => 1u64 << 63,
        };
        kind_bit | ((self.generation as u64 & 0x7FFF_FFFF) << 32) | self.index as u64
    }

    /// Inverse of `to_bits`.
    pub fn from_bits(bits: u64) -> Self {
        let kind = if bits >> 63 == 1 {
            PortKind::Subscriber
        } else {
            PortKind::Publisher
        };
        Self {
            kind,
            index: bits as u32,
            generation: ((bits >> 32) & 0x7FFF_FFFF) as u32,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.kind.name(), self.index, self.generation)
    }
}
