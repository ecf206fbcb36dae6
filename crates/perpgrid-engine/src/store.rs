/*
[INPUT]:  Ledger snapshots from the coordinator and reconciler
[OUTPUT]: One integrity-checked row of durable state per symbol
[POS]:    Persistence layer - SQLite-backed write-ahead of local intent
[UPDATE]: When the schema or integrity policy changes
*/

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use thiserror::Error;

use crate::snapshot::LedgerSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The stored row or its embedded slot digest does not match; the
    /// store is corrupt and boot must abort.
    #[error("integrity error: {0}")]
    Integrity(String),
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    data TEXT NOT NULL,
    checksum BLOB NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// Durable store holding exactly one ledger snapshot.
///
/// Calls are short single-row statements; the connection is serialized
/// behind a mutex and saves commit inside a transaction.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Loads the snapshot; `None` when nothing was ever saved. Fails
    /// on row or slot-map checksum mismatch.
    pub fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        let conn = self.conn.lock().expect("store mutex");
        let row: Option<(String, Vec<u8>)> = conn
            .query_row("SELECT data, checksum FROM state WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        let Some((data, checksum)) = row else {
            return Ok(None);
        };

        if digest(&data) != checksum {
            return Err(StoreError::Integrity("row checksum mismatch".into()));
        }

        let snapshot: LedgerSnapshot = serde_json::from_str(&data)?;
        if !snapshot.verify() {
            return Err(StoreError::Integrity("slot map digest mismatch".into()));
        }
        Ok(Some(snapshot))
    }

    /// Atomic single-row upsert; idempotent for identical snapshots.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_string(snapshot)?;
        let checksum = digest(&data);

        let mut conn = self.conn.lock().expect("store mutex");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO state (id, data, checksum, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 data = excluded.data,
                 checksum = excluded.checksum,
                 updated_at = excluded.updated_at",
            params![data, checksum, chrono::Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn digest(data: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().to_vec()
}
