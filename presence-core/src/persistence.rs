//! SQLite persistence for per-entity memory records.
//!
//! Each entity's [`MemoryRecord`] is serialised to JSON and stored as one
//! row; every write is a whole-record upsert:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS memory_records (
//!     entity     TEXT PRIMARY KEY,
//!     data       BLOB NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     checksum   TEXT
//! );
//! ```
//!
//! - WAL mode so reads never wait behind the writer
//! - Optional CRC-32 checksum detects corrupted rows (logged, still returned)
//! - Online backup via SQLite's backup API

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::{PresenceError, Result};
use crate::memory::MemoryRecord;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS memory_records (
    entity     TEXT PRIMARY KEY,
    data       BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    checksum   TEXT
);";

/// Durable storage for memory records, keyed by entity name.
pub trait RecordStore: Send + Sync {
    /// Load the record for `entity`, `None` if it was never written.
    ///
    /// # Errors
    /// Storage or decoding failure.
    fn load(&self, entity: &str) -> Result<Option<MemoryRecord>>;

    /// Overwrite the record for `entity`.
    ///
    /// # Errors
    /// Storage or encoding failure.
    fn save(&self, entity: &str, record: &MemoryRecord) -> Result<()>;

    /// Remove the record for `entity`. Returns whether a row existed.
    ///
    /// # Errors
    /// Storage failure.
    fn delete(&self, entity: &str) -> Result<bool>;

    /// Every entity with a stored record.
    ///
    /// # Errors
    /// Storage failure.
    fn list_entities(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// CRC-32 checksum helper
// ---------------------------------------------------------------------------

fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32_compute(data))
}

/// Basic CRC-32 (ISO 3309 / ITU-T V.42) computation.
fn crc32_compute(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

// ---------------------------------------------------------------------------
// SqliteRecordStore
// ---------------------------------------------------------------------------

/// [`RecordStore`] backed by a single SQLite file.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    checksum_enabled: bool,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("db_path", &self.db_path)
            .field("checksum_enabled", &self.checksum_enabled)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    /// Open (or create) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, checksum_enabled: bool) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "Memory record store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            checksum_enabled,
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Database`] on SQLite failures.
    pub fn open_in_memory(checksum_enabled: bool) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            checksum_enabled,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Copy the database to `dest_path` with SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;

        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Memory database backup completed"
        );
        Ok(())
    }

    /// Path to the database file (or `:memory:`).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl RecordStore for SqliteRecordStore {
    fn load(&self, entity: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT data, checksum FROM memory_records WHERE entity = ?1")?;
        let row: Option<(Vec<u8>, Option<String>)> = stmt
            .query_row(params![entity], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((data, stored_checksum)) = row else {
            return Ok(None);
        };

        if self.checksum_enabled {
            if let Some(expected) = stored_checksum {
                let actual = crc32_hex(&data);
                if expected != actual {
                    warn!(
                        entity,
                        expected = %expected,
                        actual = %actual,
                        "Checksum mismatch on memory record"
                    );
                }
            }
        }

        let record: MemoryRecord = serde_json::from_slice(&data)
            .map_err(|e| PresenceError::Serialization(e.to_string()))?;
        debug!(entity, recent = record.recent.len(), "Loaded memory record");
        Ok(Some(record))
    }

    fn save(&self, entity: &str, record: &MemoryRecord) -> Result<()> {
        let json =
            serde_json::to_vec(record).map_err(|e| PresenceError::Serialization(e.to_string()))?;
        let checksum = self.checksum_enabled.then(|| crc32_hex(&json));
        let now = Utc::now().to_rfc3339();

        self.conn.lock().execute(
            "INSERT INTO memory_records (entity, data, updated_at, checksum)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                checksum = excluded.checksum",
            params![entity, json, now, checksum],
        )?;

        debug!(entity, bytes = json.len(), "Saved memory record");
        Ok(())
    }

    fn delete(&self, entity: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM memory_records WHERE entity = ?1", params![entity])?;
        Ok(deleted > 0)
    }

    fn list_entities(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT entity FROM memory_records ORDER BY entity")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryRecord {
        MemoryRecord {
            summary: "Alex likes building castles.".to_string(),
            recent: vec!["Alex asked about diamonds".to_string()],
        }
    }

    #[test]
    fn round_trip_save_load() {
        let store = SqliteRecordStore::open_in_memory(true).expect("open");
        store.save("Steve_Builder", &sample()).expect("save");
        let loaded = store.load("Steve_Builder").expect("load").expect("Some");
        assert_eq!(loaded, sample());
    }

    #[test]
    fn load_missing_returns_none() {
        let store = SqliteRecordStore::open_in_memory(true).expect("open");
        assert!(store.load("nobody").expect("load").is_none());
    }

    #[test]
    fn save_overwrites_whole_record() {
        let store = SqliteRecordStore::open_in_memory(true).expect("open");
        store.save("Luna", &sample()).expect("save");
        let replacement = MemoryRecord {
            summary: String::new(),
            recent: vec!["fresh".into()],
        };
        store.save("Luna", &replacement).expect("save");
        assert_eq!(store.load("Luna").expect("load"), Some(replacement));
        assert_eq!(store.list_entities().expect("list"), vec!["Luna".to_string()]);
    }

    #[test]
    fn delete_reports_existence() {
        let store = SqliteRecordStore::open_in_memory(false).expect("open");
        store.save("Luna", &sample()).expect("save");
        assert!(store.delete("Luna").expect("delete"));
        assert!(!store.delete("Luna").expect("delete again"));
    }

    #[test]
    fn corrupted_checksum_still_loads() {
        let store = SqliteRecordStore::open_in_memory(true).expect("open");
        store.save("Luna", &sample()).expect("save");
        store
            .conn
            .lock()
            .execute(
                "UPDATE memory_records SET checksum = 'deadbeef' WHERE entity = ?1",
                params!["Luna"],
            )
            .expect("corrupt checksum");
        assert!(store.load("Luna").expect("load").is_some());
    }

    #[test]
    fn file_backed_store_and_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteRecordStore::open(dir.path().join("memory.db"), true).expect("open");
        store.save("Steve_Builder", &sample()).expect("save");

        let backup_path = dir.path().join("memory_backup.db");
        store.backup(&backup_path).expect("backup");

        let restored = SqliteRecordStore::open(&backup_path, true).expect("open backup");
        assert!(restored.load("Steve_Builder").expect("load").is_some());
    }

    #[test]
    fn crc32_basic() {
        assert_eq!(crc32_compute(b"123456789"), 0xCBF4_3926);
    }
}
