//! Buffer state machine.
//!
//! ```text
//!            request_memory                 finalize (durable drained)
//! Database ─────────────────▶ DrainingToMemory ─────────────────────▶ Memory
//!    ▲                               │                                  │
//!    │ finalize (memory empty)       │ fallback                fallback │
//!    │                               ▼                                  │
//!    └─────────────────────── DrainingToDatabase ◀──────────────────────┘
//! ```
//!
//! Transition functions take the current state by value and return the next
//! one; the controller is the only place that stores the result.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::BufferError;

/// Where a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Memory,
    Database,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Database => f.write_str("database"),
        }
    }
}

/// Configured buffering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// Every record goes through the database.
    #[default]
    Disk,
    /// Records stay in memory; quota exhaustion is reported to producers.
    Memory,
    /// Memory first, spilling to the database under pressure.
    Hybrid,
}

impl BufferMode {
    /// Whether the engine may ever hold records in memory.
    #[must_use]
    pub const fn allows_memory(self) -> bool {
        !matches!(self, Self::Disk)
    }

    /// Whether the engine may demote itself to the database.
    #[must_use]
    pub const fn allows_fallback(self) -> bool {
        matches!(self, Self::Hybrid)
    }

    /// State to start in given whether the database still holds unsent rows.
    #[must_use]
    pub const fn initial_state(self, durable_backlog: bool) -> BufferState {
        match self {
            Self::Disk => BufferState::Database,
            Self::Memory => BufferState::Memory,
            Self::Hybrid if durable_backlog => BufferState::DrainingToMemory,
            Self::Hybrid => BufferState::Memory,
        }
    }
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => f.write_str("disk"),
            Self::Memory => f.write_str("memory"),
            Self::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Current buffering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    Database,
    DrainingToMemory,
    Memory,
    DrainingToDatabase,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => f.write_str("database"),
            Self::DrainingToMemory => f.write_str("database->memory"),
            Self::Memory => f.write_str("memory"),
            Self::DrainingToDatabase => f.write_str("memory->database"),
        }
    }
}

impl BufferState {
    /// Tier new records are admitted to.
    ///
    /// In `DrainingToMemory` the controller still routes to the database
    /// while a durable insert for the same stream is in flight.
    #[must_use]
    pub const fn admission_target(self) -> StorageTier {
        match self {
            Self::Database | Self::DrainingToDatabase => StorageTier::Database,
            Self::DrainingToMemory | Self::Memory => StorageTier::Memory,
        }
    }

    /// Operator or policy request to buffer in memory again.
    pub fn request_memory(self) -> Result<Self, BufferError> {
        match self {
            Self::Database => Ok(Self::DrainingToMemory),
            Self::DrainingToMemory | Self::Memory => Ok(self),
            Self::DrainingToDatabase => Err(BufferError::Transition {
                from: self,
                reason: "memory records are still draining to the database".to_string(),
            }),
        }
    }

    /// Demote to durable admission; memory records keep draining.
    #[must_use]
    pub const fn fallback(self) -> Self {
        match self {
            Self::Memory | Self::DrainingToMemory => Self::DrainingToDatabase,
            Self::Database | Self::DrainingToDatabase => self,
        }
    }

    /// Complete a drain once its source tier is empty.
    #[must_use]
    pub const fn finalize(self, memory_empty: bool, durable_drained: bool) -> Self {
        match self {
            Self::DrainingToDatabase if memory_empty => Self::Database,
            Self::DrainingToMemory if durable_drained => Self::Memory,
            _ => self,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Database => 0,
            Self::DrainingToMemory => 1,
            Self::Memory => 2,
            Self::DrainingToDatabase => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::DrainingToMemory,
            2 => Self::Memory,
            3 => Self::DrainingToDatabase,
            _ => Self::Database,
        }
    }
}

/// Lock-free view of the current state for monitoring.
///
/// Only the controller stores into it, and only while holding the buffer
/// mutex.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    value: Arc<AtomicU8>,
}

impl StateSnapshot {
    #[must_use]
    pub fn new(state: BufferState) -> Self {
        Self {
            value: Arc::new(AtomicU8::new(state.as_u8())),
        }
    }

    #[must_use]
    pub fn load(&self) -> BufferState {
        BufferState::from_u8(self.value.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: BufferState) {
        self.value.store(state.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_targets_follow_state() {
        assert_eq!(BufferState::Database.admission_target(), StorageTier::Database);
        assert_eq!(BufferState::DrainingToMemory.admission_target(), StorageTier::Memory);
        assert_eq!(BufferState::Memory.admission_target(), StorageTier::Memory);
        assert_eq!(
            BufferState::DrainingToDatabase.admission_target(),
            StorageTier::Database
        );
    }

    #[test]
    fn full_cycle() {
        let s = BufferState::Database.request_memory().unwrap();
        assert_eq!(s, BufferState::DrainingToMemory);
        assert_eq!(s.finalize(true, false), BufferState::DrainingToMemory);
        let s = s.finalize(false, true);
        assert_eq!(s, BufferState::Memory);
        let s = s.fallback();
        assert_eq!(s, BufferState::DrainingToDatabase);
        assert_eq!(s.finalize(false, true), BufferState::DrainingToDatabase);
        assert_eq!(s.finalize(true, false), BufferState::Database);
    }

    #[test]
    fn request_memory_rejected_while_draining_out() {
        let err = BufferState::DrainingToDatabase.request_memory().unwrap_err();
        assert!(matches!(err, BufferError::Transition { .. }));
    }

    #[test]
    fn request_memory_is_idempotent() {
        assert_eq!(BufferState::Memory.request_memory().unwrap(), BufferState::Memory);
        assert_eq!(
            BufferState::DrainingToMemory.request_memory().unwrap(),
            BufferState::DrainingToMemory
        );
    }

    #[test]
    fn fallback_from_database_is_noop() {
        assert_eq!(BufferState::Database.fallback(), BufferState::Database);
    }

    #[test]
    fn initial_state_per_mode() {
        assert_eq!(BufferMode::Disk.initial_state(false), BufferState::Database);
        assert_eq!(BufferMode::Memory.initial_state(true), BufferState::Memory);
        assert_eq!(BufferMode::Hybrid.initial_state(false), BufferState::Memory);
        assert_eq!(
            BufferMode::Hybrid.initial_state(true),
            BufferState::DrainingToMemory
        );
    }

    #[test]
    fn snapshot_roundtrips_every_state() {
        let snapshot = StateSnapshot::new(BufferState::Database);
        for state in [
            BufferState::Database,
            BufferState::DrainingToMemory,
            BufferState::Memory,
            BufferState::DrainingToDatabase,
        ] {
            snapshot.store(state);
            assert_eq!(snapshot.load(), state);
        }
    }

    #[test]
    fn mode_serde_uses_snake_case() {
        let mode: BufferMode = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(mode, BufferMode::Hybrid);
        assert_eq!(BufferState::DrainingToDatabase.to_string(), "memory->database");
    }
}
