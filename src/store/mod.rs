//! Durable state store with optimistic concurrency
//!
//! A store holds exactly one [`State`] document plus an opaque
//! [`VersionToken`]. Writes are compare-and-swap: `save` succeeds only when
//! the caller's expected version matches the stored one, otherwise it fails
//! with [`StoreError::Conflict`] and leaves the stored document untouched.
//!
//! Stores never merge. Reconciling a conflict is the caller's job.
//!
//! ## Backends
//!
//! - `sqlite` - single-row table, CAS inside an immediate transaction
//! - `json`   - versioned JSON envelope replaced via temp file + rename
//! - `memory` - process-local, for tests and throwaway runs

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStateStore;

use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque revision marker for a stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(u64);

impl VersionToken {
    pub(crate) fn first() -> Self {
        VersionToken(1)
    }

    pub(crate) fn next(self) -> Self {
        VersionToken(self.0 + 1)
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        VersionToken(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    /// Token for the revision written after `current` (or the first one)
    pub(crate) fn successor(current: Option<VersionToken>) -> Self {
        current.map_or_else(VersionToken::first, VersionToken::next)
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A loaded document and the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub state: State,
    pub version: VersionToken,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to retrieve state: {0}")]
    Retrieval(String),
    #[error("version conflict: expected {expected:?}, found {actual:?}")]
    Conflict {
        expected: Option<VersionToken>,
        actual: Option<VersionToken>,
    },
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Compare-and-swap persistence for the aggregate state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last saved document, or `None` on first run
    async fn load(&self) -> Result<Option<Versioned>, StoreError>;

    /// Write `state` if the stored version equals `expected`
    /// (`None` = no document may exist yet). Returns the new version.
    async fn save(
        &self,
        state: &State,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, StoreError>;

    /// Backend name for logging
    fn backend_type(&self) -> &'static str;
}

pub(crate) fn check_version(
    expected: Option<VersionToken>,
    actual: Option<VersionToken>,
) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::Conflict { expected, actual })
    }
}
