//! SQLite-backed state store
//!
//! Schema (created on open, idempotent):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS state_document (
//!     id          INTEGER PRIMARY KEY CHECK (id = 1),
//!     version     INTEGER NOT NULL,
//!     body        TEXT    NOT NULL,
//!     updated_at  INTEGER NOT NULL
//! );
//! ```
//!
//! The version check and the write run inside one IMMEDIATE transaction, so
//! a second process writing the same file cannot interleave between them.

use super::{check_version, StateStore, StoreError, VersionToken, Versioned};
use crate::state::State;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS state_document (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    version     INTEGER NOT NULL,
    body        TEXT    NOT NULL,
    updated_at  INTEGER NOT NULL
);
"#;

pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open (or create) the database at `db_path` and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref()).map_err(backend)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // In-memory databases report "memory" and ignore the request
        conn.pragma_update(None, "journal_mode", "WAL").map_err(backend)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        log::debug!("📊 SQLite state store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn current_version(conn: &Connection) -> Result<Option<VersionToken>, rusqlite::Error> {
    conn.query_row(
        "SELECT version FROM state_document WHERE id = 1",
        [],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|raw| VersionToken::from_raw(raw as u64)))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self) -> Result<Option<Versioned>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT version, body FROM state_document WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::Retrieval(e.to_string()))?;

        match row {
            Some((version, body)) => {
                let state: State = serde_json::from_str(&body)?;
                Ok(Some(Versioned {
                    state,
                    version: VersionToken::from_raw(version as u64),
                }))
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        state: &State,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        let body = serde_json::to_string(state)?;
        let now = chrono::Utc::now().timestamp();

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let current = current_version(&tx).map_err(backend)?;
        // Dropping `tx` on the error path rolls back
        check_version(expected, current)?;

        let version = VersionToken::successor(current);
        tx.execute(
            r#"
            INSERT INTO state_document (id, version, body, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![version.raw() as i64, body, now],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;

        log::debug!("💾 Saved state {} to SQLite", version);
        Ok(version)
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}
