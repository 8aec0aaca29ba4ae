//! JSON file state store
//!
//! The file holds an envelope:
//!
//! ```json
//! {"version": 3, "saved_at": 1700000000, "state": {"count": ..., ...}}
//! ```
//!
//! Saves hold an exclusive lock on a sibling `.lock` file across the version
//! read, compare, write, and rename, so two handles (in one process or
//! several) cannot both pass the check for the same version. Each writer
//! stages its document in its own temp file and renames it over the target,
//! so a reader never sees a half-written document.

use super::{check_version, StateStore, StoreError, VersionToken, Versioned};
use crate::state::State;
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: VersionToken,
    saved_at: i64,
    state: State,
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_envelope(&self) -> Result<Option<Envelope>, StoreError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Retrieval(format!("{}: {}", self.path.display(), e))),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    /// Unique per process and per save, so concurrent writers never share one
    fn tmp_path(&self) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.sibling(&format!(".{}.{}.tmp", std::process::id(), seq))
    }

    /// Block until this handle holds the writer lock; released when the
    /// returned file is dropped.
    fn acquire_lock(&self) -> Result<File, StoreError> {
        let lock_path = self.lock_path();
        let io_err =
            |e: std::io::Error| StoreError::Backend(format!("{}: {}", lock_path.display(), e));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;
        lock_file.lock_exclusive().map_err(io_err)?;
        Ok(lock_file)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Versioned>, StoreError> {
        let envelope = self.read_envelope()?;
        if envelope.is_none() {
            log::info!("No existing state file found: {}", self.path.display());
        }
        Ok(envelope.map(|e| Versioned {
            state: e.state,
            version: e.version,
        }))
    }

    async fn save(
        &self,
        state: &State,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        let _lock = self.acquire_lock()?;

        let current = self.read_envelope()?.map(|e| e.version);
        check_version(expected, current)?;

        let envelope = Envelope {
            version: VersionToken::successor(current),
            saved_at: chrono::Utc::now().timestamp(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let tmp = self.tmp_path();
        let io_err = |e: std::io::Error| StoreError::Backend(format!("{}: {}", tmp.display(), e));
        fs::write(&tmp, json).map_err(io_err)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        log::debug!(
            "💾 Saved state {} to {}",
            envelope.version,
            self.path.display()
        );
        Ok(envelope.version)
    }

    fn backend_type(&self) -> &'static str {
        "json"
    }
}
