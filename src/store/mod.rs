//! Local state store: a durable SQLite mirror of panel admin state.
//!
//! The store is the source of truth when the panel is unreachable. All
//! mutations are transactional; a write either fully commits or leaves prior
//! state untouched. Schema changes are applied through named, additive
//! migrations so older archives stay readable.

mod records;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub use records::{AdminRecord, AdminStatus};

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Snapshot failed: {0}")]
    Snapshot(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cursor describing the last successful reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// When the last clean pass completed.
    pub last_sync: DateTime<Utc>,

    /// SHA-256 over the sorted admin record set at that time.
    pub set_hash: String,
}

/// Outcome of the most recent backup run, persisted for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBookkeeping {
    /// Archive identifier, present when the run produced one.
    pub archive_id: Option<String>,

    /// When the run finished.
    pub finished_at: DateTime<Utc>,

    /// `complete` or `failed`.
    pub status: String,

    /// Failure reason when status is `failed`.
    pub reason: Option<String>,
}

const META_SYNC_CURSOR: &str = "sync_cursor";
const META_LAST_BACKUP: &str = "last_backup";

/// Durable mirror of panel admin state.
pub struct StateStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl StateStore {
    /// Opens (or creates) the store at the given path and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(&db_path)?;

        // WAL keeps readers unblocked during reconciliation writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Opens an in-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let migrations: &[(&str, &str)] = &[
            (
                "create_admins_table",
                "CREATE TABLE IF NOT EXISTS admins (
                    username TEXT PRIMARY KEY,
                    is_sudo INTEGER NOT NULL DEFAULT 0,
                    data_limit INTEGER,
                    used_traffic INTEGER NOT NULL DEFAULT 0,
                    expire_at TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    synced_at TEXT NOT NULL
                )",
            ),
            (
                "create_meta_table",
                "CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
            ),
            (
                "create_admins_status_index",
                "CREATE INDEX IF NOT EXISTS idx_admins_status ON admins(status)",
            ),
        ];

        for (name, sql) in migrations {
            let applied: i64 = conn
                .prepare("SELECT COUNT(*) FROM migrations WHERE name = ?1")?
                .query_row([name], |row| row.get(0))?;

            if applied == 0 {
                info!("Applying migration: {}", name);
                conn.execute(sql, [])
                    .map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
                conn.execute("INSERT INTO migrations (name) VALUES (?1)", [name])?;
            } else {
                debug!("Migration already applied: {}", name);
            }
        }

        Ok(())
    }

    /// Fetches a single admin record by username.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, username: &str) -> StoreResult<Option<AdminRecord>> {
        let conn = self.lock()?;
        let record = conn
            .prepare(
                "SELECT username, is_sudo, data_limit, used_traffic, expire_at, status, synced_at
                 FROM admins WHERE username = ?1",
            )?
            .query_row([username], records::row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Inserts or replaces an admin record in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; prior state is untouched.
    pub fn upsert(&self, record: &AdminRecord) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        records::upsert_in_tx(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes an admin record. Deleting an absent record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, username: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM admins WHERE username = ?1", [username])?;
        Ok(changed > 0)
    }

    /// Lists all admin records ordered by username.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self) -> StoreResult<Vec<AdminRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT username, is_sudo, data_limit, used_traffic, expire_at, status, synced_at
             FROM admins ORDER BY username",
        )?;
        let rows = stmt.query_map([], records::row_to_record)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Replaces the entire admin set in one transaction.
    ///
    /// Used by restore: either every record from the snapshot lands, or the
    /// previous set stays intact.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails; the transaction rolls back.
    pub fn replace_all(&self, admins: &[AdminRecord]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM admins", [])?;
        for record in admins {
            records::upsert_in_tx(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads the sync cursor, if one has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or decode fails.
    pub fn sync_cursor(&self) -> StoreResult<Option<SyncCursor>> {
        self.read_meta(META_SYNC_CURSOR)
    }

    /// Records the sync cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_sync_cursor(&self, cursor: &SyncCursor) -> StoreResult<()> {
        self.write_meta(META_SYNC_CURSOR, cursor)
    }

    /// Reads the last backup outcome, if one has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or decode fails.
    pub fn last_backup(&self) -> StoreResult<Option<BackupBookkeeping>> {
        self.read_meta(META_LAST_BACKUP)
    }

    /// Records the outcome of a backup run.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_last_backup(&self, entry: &BackupBookkeeping) -> StoreResult<()> {
        self.write_meta(META_LAST_BACKUP, entry)
    }

    fn read_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .prepare("SELECT value FROM meta WHERE key = ?1")?
            .query_row([key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, json],
        )?;
        Ok(())
    }

    /// Writes a consistent snapshot of the database to `dest`.
    ///
    /// Takes the connection lock only for the duration of the `VACUUM INTO`,
    /// so reconciliation writes and the snapshot never interleave.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn snapshot_to(&self, dest: impl AsRef<Path>) -> StoreResult<()> {
        let dest = dest.as_ref();
        if dest.exists() {
            std::fs::remove_file(dest)
                .map_err(|e| StoreError::Snapshot(format!("cannot clear {}: {e}", dest.display())))?;
        }
        let dest_str = dest
            .to_str()
            .ok_or_else(|| StoreError::Snapshot("non-UTF-8 snapshot path".to_owned()))?;
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", [dest_str])?;
        debug!("Database snapshot written to {}", dest.display());
        Ok(())
    }

    /// Computes the SHA-256 hash of the current admin set.
    ///
    /// The hash covers the identity-relevant fields in username order, so two
    /// stores with the same admins produce the same value.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub fn admin_set_hash(&self) -> StoreResult<String> {
        let admins = self.list()?;
        Ok(hash_admin_set(&admins))
    }
}

/// Hashes an admin record set for the sync cursor idempotence check.
#[must_use]
pub fn hash_admin_set(admins: &[AdminRecord]) -> String {
    let mut sorted: Vec<&AdminRecord> = admins.iter().collect();
    sorted.sort_by(|a, b| a.username.cmp(&b.username));

    let mut hasher = Sha256::new();
    for admin in sorted {
        hasher.update(admin.username.as_bytes());
        hasher.update(b"|");
        hasher.update(admin.data_limit.map_or_else(|| "none".to_owned(), |v| v.to_string()));
        hasher.update(b"|");
        hasher.update(admin.used_traffic.to_string());
        hasher.update(b"|");
        hasher.update(
            admin
                .expire_at
                .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339()),
        );
        hasher.update(b"|");
        hasher.update(admin.status.as_str());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}
