//! In-process store

use super::{check_version, StateStore, StoreError, VersionToken, Versioned};
use crate::state::State;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `state` at the first version
    pub fn with_state(state: State) -> Self {
        Self {
            document: Mutex::new(Some(Versioned {
                state,
                version: VersionToken::first(),
            })),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<Versioned>, StoreError> {
        let document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(document.clone())
    }

    async fn save(
        &self,
        state: &State,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        let current = document.as_ref().map(|d| d.version);
        check_version(expected, current)?;

        let version = VersionToken::successor(current);
        *document = Some(Versioned {
            state: state.clone(),
            version,
        });
        Ok(version)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
