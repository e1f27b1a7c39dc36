//! # Persistent Store
//!
//! Embedded transactional storage backed by SQLite:
//! - **Checksummed projects**: every write seals the record, every read
//!   verifies it; a mismatch surfaces as `DataCorrupted`, never as data
//! - **Append-only checkpoints**: snapshots with their own checksum,
//!   cascaded away when their project is deleted
//! - **Idempotency records**: completed-operation results with a TTL
//! - **Settings**: small key/value table
//!
//! Each operation opens its own connection. Conflicting writers serialize on
//! SQLite's locks; `BUSY`/`LOCKED` come back as transient errors and are
//! retried with the configured [`RetryPolicy`](crate::retry::RetryPolicy).
//!
//! ## Example
//!
//! ```rust,no_run
//! use calc_store::config::StoreConfig;
//! use calc_store::project::ProjectRecord;
//! use calc_store::store::PersistentStore;
//! use std::path::Path;
//!
//! let store = PersistentStore::open(Path::new("stratify.db"), StoreConfig::default())?;
//! let saved = store.save(&ProjectRecord::new("Warehouse", "Roof snow check"))?;
//! let loaded = store.load(&saved.id)?.expect("just saved");
//! assert!(loaded.verify_checksum());
//! # Ok::<(), calc_store::errors::StoreError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::integrity;
use crate::project::{
    Checkpoint, CheckpointOperation, IdempotencyRecord, ProjectRecord, ProjectSummary,
};

/// Schema version written to `store_meta`
pub const SCHEMA_VERSION: i64 = 1;

/// Checkpoint rows read per query while skipping corrupt ones
const CHECKPOINT_PAGE: usize = 16;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        body BLOB NOT NULL,
        checksum TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        snapshot BLOB NOT NULL,
        checksum TEXT NOT NULL,
        size INTEGER NOT NULL,
        operation TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_project
        ON checkpoints (project_id, created_at);
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key TEXT PRIMARY KEY,
        operation TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        result TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

/// Point-in-time health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub schema_version: i64,
    pub project_count: u64,
    pub checkpoint_count: u64,
    pub idempotency_key_count: u64,
    pub settings_count: u64,
    /// Size of the main database file (WAL excluded)
    pub database_bytes: u64,
    pub journal_mode: String,
    /// `PRAGMA quick_check` came back "ok"
    pub integrity_ok: bool,
    pub integrity_detail: String,
}

/// Handle to the on-disk store. Cloning is cheap and shares configuration.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    config: StoreConfig,
}

impl PersistentStore {
    /// Open (and if needed create) the database at `path`.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    StoreError::from_io("create data directory", parent.display().to_string(), &e)
                })?;
            }
        }

        let store = PersistentStore {
            inner: Arc::new(StoreInner {
                path: path.to_path_buf(),
                config,
            }),
        };
        store.inner.config.retry.run_blocking("initialize schema", |_| store.initialize_schema())?;
        tracing::info!(path = %path.display(), schema_version = SCHEMA_VERSION, "store opened");
        Ok(store)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn connect(&self) -> StoreResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.inner.path, flags)
            .map_err(|e| StoreError::from_sqlite("open database", e))?;
        conn.busy_timeout(Duration::from_millis(self.inner.config.busy_timeout_ms))
            .map_err(|e| StoreError::from_sqlite("configure connection", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")
            .map_err(|e| StoreError::from_sqlite("configure connection", e))?;
        Ok(conn)
    }

    fn initialize_schema(&self) -> StoreResult<()> {
        let mut conn = self.connect()?;
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))
            .map_err(|e| StoreError::from_sqlite("set journal mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %journal_mode, "WAL journal mode unavailable");
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::from_sqlite("initialize schema", e))?;
        tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
            .map_err(|e| StoreError::from_sqlite("initialize schema", e))?;
        let found: Option<i64> = tx
            .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(|e| StoreError::from_sqlite("initialize schema", e))?;
        match found {
            None => {
                tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                    .map_err(|e| StoreError::from_sqlite("initialize schema", e))?;
            }
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StoreError::VersionMismatch {
                    found_version: version,
                    expected_version: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        tx.execute_batch(SCHEMA)
            .map_err(|e| StoreError::from_sqlite("initialize schema", e))?;
        tx.commit().map_err(|e| StoreError::from_sqlite("initialize schema", e))
    }

    /// Run a read-only closure on a fresh connection, retrying transient failures.
    fn with_connection<T>(
        &self,
        operation: &str,
        f: impl Fn(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.inner.config.retry.run_blocking(operation, |_| {
            let conn = self.connect()?;
            f(&conn)
        })
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits on success. On failure the transaction is rolled back; a
    /// failed rollback is logged but the original error is returned.
    fn in_transaction<T>(
        &self,
        operation: &str,
        f: impl Fn(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.inner.config.retry.run_blocking(operation, |_| {
            let mut conn = self.connect()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| StoreError::from_sqlite(operation, e))?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit().map_err(|e| StoreError::from_sqlite(operation, e))?;
                    Ok(value)
                }
                Err(err) => {
                    match tx.rollback() {
                        Ok(()) => {
                            tracing::debug!(operation, error = %err, "transaction rolled back")
                        }
                        Err(rollback_err) => tracing::error!(
                            operation,
                            error = %err,
                            rollback_error = %rollback_err,
                            "transaction rollback failed"
                        ),
                    }
                    Err(err)
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Upsert a project, sealing it with a fresh checksum.
    ///
    /// `updated_at` is assigned here. Returns the record exactly as stored.
    pub fn save(&self, project: &ProjectRecord) -> StoreResult<ProjectRecord> {
        if project.id.trim().is_empty() {
            return Err(StoreError::validation_failed("id", "", "Project id must not be empty"));
        }
        let mut record = project.clone();
        record.updated_at = Utc::now();
        let body = record.seal()?;

        self.in_transaction("save project", |tx| {
            tx.execute(
                "INSERT INTO projects
                    (id, name, description, body, checksum, created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    body = excluded.body,
                    checksum = excluded.checksum,
                    updated_at = excluded.updated_at,
                    version = excluded.version",
                params![
                    record.id,
                    record.name,
                    record.description,
                    body,
                    record.checksum,
                    format_ts(&record.created_at),
                    format_ts(&record.updated_at),
                    record.version as i64,
                ],
            )
            .map_err(|e| StoreError::from_sqlite("save project", e))?;
            Ok(())
        })?;

        tracing::debug!(project_id = %record.id, version = record.version, "project saved");
        Ok(record)
    }

    /// Load and verify a project.
    ///
    /// `Ok(None)` when absent; `Err(DataCorrupted)` when the stored body
    /// does not match its checksum or cannot be decoded.
    pub fn load(&self, id: &str) -> StoreResult<Option<ProjectRecord>> {
        let row = self.with_connection("load project", |conn| {
            conn.query_row(
                "SELECT body, checksum FROM projects WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::from_sqlite("load project", e))
        })?;

        match row {
            None => Ok(None),
            Some((body, checksum)) => {
                match ProjectRecord::from_verified_body(id, &body, &checksum) {
                    Ok(record) => Ok(Some(record)),
                    Err(err) => {
                        tracing::error!(
                            project_id = id,
                            error = %err,
                            "stored project failed verification"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Whether a project row exists (without verifying it).
    pub fn exists(&self, id: &str) -> StoreResult<bool> {
        self.with_connection("check project", |conn| {
            conn.query_row("SELECT 1 FROM projects WHERE id = ?1", params![id], |_| Ok(()))
                .optional()
                .map(|found| found.is_some())
                .map_err(|e| StoreError::from_sqlite("check project", e))
        })
    }

    /// Delete a project and all of its checkpoints.
    ///
    /// Returns `false` if the project was already absent; that is not an error.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let (removed, checkpoints) = self.in_transaction("delete project", |tx| {
            let checkpoints = tx
                .execute("DELETE FROM checkpoints WHERE project_id = ?1", params![id])
                .map_err(|e| StoreError::from_sqlite("delete checkpoints", e))?;
            let removed = tx
                .execute("DELETE FROM projects WHERE id = ?1", params![id])
                .map_err(|e| StoreError::from_sqlite("delete project", e))?;
            Ok((removed > 0, checkpoints))
        })?;
        tracing::debug!(project_id = id, removed, checkpoints, "project deleted");
        Ok(removed)
    }

    /// Summaries of all projects, most recently updated first.
    pub fn list_projects(&self) -> StoreResult<Vec<ProjectSummary>> {
        self.with_connection("list projects", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, updated_at, version FROM projects
                     ORDER BY updated_at DESC, rowid DESC",
                )
                .map_err(|e| StoreError::from_sqlite("list projects", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| StoreError::from_sqlite("list projects", e))?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, name, updated_at, version) =
                    row.map_err(|e| StoreError::from_sqlite("list projects", e))?;
                summaries.push(ProjectSummary {
                    updated_at: parse_ts(&id, &updated_at)?,
                    id,
                    name,
                    version: version as u64,
                });
            }
            Ok(summaries)
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Append a checkpoint. The project must exist.
    pub fn create_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let snapshot = integrity::canonical_bytes(&checkpoint.data)?;
        let digest = integrity::checksum(&snapshot);

        self.in_transaction("create checkpoint", |tx| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM projects WHERE id = ?1",
                    params![checkpoint.project_id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(|e| StoreError::from_sqlite("create checkpoint", e))?
                .is_some();
            if !exists {
                return Err(StoreError::not_found("project", checkpoint.project_id.clone()));
            }
            tx.execute(
                "INSERT INTO checkpoints
                    (id, project_id, snapshot, checksum, size, operation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    checkpoint.id,
                    checkpoint.project_id,
                    snapshot,
                    digest,
                    snapshot.len() as i64,
                    checkpoint.operation.as_str(),
                    format_ts(&checkpoint.timestamp),
                ],
            )
            .map_err(|e| StoreError::from_sqlite("create checkpoint", e))?;
            Ok(())
        })
    }

    /// Most recent checkpoints of a project, newest first.
    ///
    /// Rows that fail verification are skipped and logged; older rows are
    /// read until `limit` verified checkpoints are found or none are left.
    pub fn list_checkpoints(&self, project_id: &str, limit: usize) -> StoreResult<Vec<Checkpoint>> {
        let page = limit.max(CHECKPOINT_PAGE);
        let mut checkpoints = Vec::with_capacity(limit);
        let mut offset = 0;
        while checkpoints.len() < limit {
            let rows = self.checkpoint_page(project_id, page, offset)?;
            let exhausted = rows.len() < page;
            offset += rows.len();
            for row in rows {
                let id = row.id.clone();
                match row.into_checkpoint() {
                    Ok(checkpoint) if checkpoints.len() < limit => checkpoints.push(checkpoint),
                    Ok(_) => break,
                    Err(err) => tracing::warn!(
                        checkpoint_id = %id,
                        project_id,
                        error = %err,
                        "skipping corrupted checkpoint"
                    ),
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(checkpoints)
    }

    fn checkpoint_page(
        &self,
        project_id: &str,
        page: usize,
        offset: usize,
    ) -> StoreResult<Vec<CheckpointRow>> {
        self.with_connection("list checkpoints", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, snapshot, checksum, size, operation, created_at
                     FROM checkpoints WHERE project_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                )
                .map_err(|e| StoreError::from_sqlite("list checkpoints", e))?;
            let rows = stmt
                .query_map(
                    params![project_id, page as i64, offset as i64],
                    CheckpointRow::from_row,
                )
                .map_err(|e| StoreError::from_sqlite("list checkpoints", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::from_sqlite("list checkpoints", e))
        })
    }

    /// Load one checkpoint by id, verified.
    ///
    /// `Ok(None)` if it does not exist, `Err(DataCorrupted)` if it fails
    /// verification.
    pub fn restore_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        let row = self.with_connection("restore checkpoint", |conn| {
            conn.query_row(
                "SELECT id, project_id, snapshot, checksum, size, operation, created_at
                 FROM checkpoints WHERE id = ?1",
                params![id],
                CheckpointRow::from_row,
            )
            .optional()
            .map_err(|e| StoreError::from_sqlite("restore checkpoint", e))
        })?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Number of checkpoints stored for a project
    pub fn checkpoint_count(&self, project_id: &str) -> StoreResult<usize> {
        self.with_connection("count checkpoints", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE project_id = ?1",
                params![project_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count as usize)
            .map_err(|e| StoreError::from_sqlite("count checkpoints", e))
        })
    }

    /// Delete all but the `keep` newest checkpoints of a project.
    pub fn prune_checkpoints(&self, project_id: &str, keep: usize) -> StoreResult<usize> {
        self.in_transaction("prune checkpoints", |tx| {
            tx.execute(
                "DELETE FROM checkpoints WHERE project_id = ?1 AND id NOT IN (
                    SELECT id FROM checkpoints WHERE project_id = ?1
                    ORDER BY created_at DESC, rowid DESC LIMIT ?2
                 )",
                params![project_id, keep as i64],
            )
            .map_err(|e| StoreError::from_sqlite("prune checkpoints", e))
        })
    }

    // ------------------------------------------------------------------
    // Idempotency
    // ------------------------------------------------------------------

    /// Whether an unexpired completion record exists for `key`.
    pub fn is_operation_completed(&self, key: &str) -> StoreResult<bool> {
        Ok(self.completed_result(key)?.is_some())
    }

    /// The unexpired completion record for `key`, if any.
    pub fn completed_result(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let now = format_ts(&Utc::now());
        let row = self.with_connection("read idempotency key", |conn| {
            conn.query_row(
                "SELECT key, operation, expires_at, result FROM idempotency_keys
                 WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::from_sqlite("read idempotency key", e))
        })?;

        match row {
            None => Ok(None),
            Some((key, operation, expires_at, result)) => Ok(Some(IdempotencyRecord {
                expires_at: parse_ts(&key, &expires_at)?,
                key,
                operation,
                result,
            })),
        }
    }

    /// Record that `key` completed with `result`, valid for `ttl`.
    pub fn mark_operation_completed(
        &self,
        key: &str,
        operation: &str,
        result: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = format_ts(&(Utc::now() + ttl));
        self.in_transaction("record idempotency key", |tx| {
            tx.execute(
                "INSERT INTO idempotency_keys (key, operation, expires_at, result)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    operation = excluded.operation,
                    expires_at = excluded.expires_at,
                    result = excluded.result",
                params![key, operation, expires_at, result],
            )
            .map_err(|e| StoreError::from_sqlite("record idempotency key", e))?;
            Ok(())
        })
    }

    /// Remove expired idempotency records.
    pub fn purge_expired_keys(&self) -> StoreResult<usize> {
        let now = format_ts(&Utc::now());
        self.in_transaction("purge idempotency keys", |tx| {
            tx.execute("DELETE FROM idempotency_keys WHERE expires_at <= ?1", params![now])
                .map_err(|e| StoreError::from_sqlite("purge idempotency keys", e))
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_connection("read setting", |conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StoreError::from_sqlite("read setting", e))
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let now = format_ts(&Utc::now());
        self.in_transaction("write setting", |tx| {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map_err(|e| StoreError::from_sqlite("write setting", e))?;
            Ok(())
        })
    }

    /// Read a JSON-encoded setting.
    pub fn get_setting_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get_setting(key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::data_corrupted(format!("setting:{}", key), e.to_string())),
        }
    }

    /// Write a setting as JSON.
    pub fn set_setting_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(value).map_err(StoreError::serialization)?;
        self.set_setting(key, &raw)
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn health(&self) -> StoreResult<StoreHealth> {
        let database_bytes = fs::metadata(&self.inner.path).map(|m| m.len()).unwrap_or(0);
        self.with_connection("health check", |conn| {
            let count = |table: &str| -> StoreResult<u64> {
                let sql = format!("SELECT COUNT(*) FROM {}", table);
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| StoreError::from_sqlite("health check", e))
            };
            let schema_version = conn
                .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
                .map_err(|e| StoreError::from_sqlite("health check", e))?;
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(|e| StoreError::from_sqlite("health check", e))?;
            let integrity_detail: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .map_err(|e| StoreError::from_sqlite("health check", e))?;

            Ok(StoreHealth {
                schema_version,
                project_count: count("projects")?,
                checkpoint_count: count("checkpoints")?,
                idempotency_key_count: count("idempotency_keys")?,
                settings_count: count("settings")?,
                database_bytes,
                journal_mode,
                integrity_ok: integrity_detail == "ok",
                integrity_detail,
            })
        })
    }
}

/// Run blocking store work on tokio's blocking pool.
///
/// SQLite calls block, so async callers route them through here instead of
/// running them on a runtime worker thread.
pub async fn offload<T, F>(operation: &'static str, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::internal(format!("{} join error: {}", operation, e)))?
}

/// Raw checkpoint columns before verification.
struct CheckpointRow {
    id: String,
    project_id: String,
    snapshot: Vec<u8>,
    checksum: String,
    size: i64,
    operation: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CheckpointRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            snapshot: row.get(2)?,
            checksum: row.get(3)?,
            size: row.get(4)?,
            operation: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Verify the row checksum and the embedded record checksum, then decode.
    fn into_checkpoint(self) -> StoreResult<Checkpoint> {
        if !integrity::verify(&self.snapshot, &self.checksum) {
            return Err(StoreError::data_corrupted(
                &self.id,
                "checkpoint checksum mismatch",
            ));
        }
        let data = ProjectRecord::from_sealed_json(&self.id, &self.snapshot)?;
        if data.id != self.project_id {
            return Err(StoreError::data_corrupted(
                &self.id,
                "snapshot belongs to another project",
            ));
        }
        let operation = self
            .operation
            .parse::<CheckpointOperation>()
            .map_err(|e: StoreError| StoreError::data_corrupted(&self.id, e.to_string()))?;
        Ok(Checkpoint {
            timestamp: parse_ts(&self.id, &self.created_at)?,
            id: self.id,
            project_id: self.project_id,
            data,
            operation,
            data_size: self.size as u64,
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::data_corrupted(id, format!("bad timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, PersistentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PersistentStore::open(&dir.path().join("stratify.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn sample_project(snow: f64) -> ProjectRecord {
        ProjectRecord::new("Warehouse", "Roof snow check")
            .with_geometry(json!({"roofSlope": 4.0, "span_ft": 40.0}))
            .with_inputs(json!({"groundSnowLoad": snow}))
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, store) = temp_store();
        let project = sample_project(35.0);
        let saved = store.save(&project).unwrap();
        let loaded = store.load(&project.id).unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert!(loaded.verify_checksum());
        assert_eq!(loaded.name, project.name);
        assert_eq!(loaded.geometry, project.geometry);
        assert_eq!(loaded.inputs, project.inputs);
        assert_eq!(loaded.created_at, project.created_at);
        assert_eq!(loaded.version, project.version);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let (_dir, store) = temp_store();
        assert!(store.load("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn test_save_is_upsert() {
        let (_dir, store) = temp_store();
        let mut project = sample_project(35.0);
        store.save(&project).unwrap();
        project.inputs = json!({"groundSnowLoad": 45.0});
        project.touch();
        store.save(&project).unwrap();

        let loaded = store.load(&project.id).unwrap().unwrap();
        assert_eq!(loaded.input_f64("groundSnowLoad"), Some(45.0));
        assert_eq!(loaded.version, 2);
        assert_eq!(store.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupted_body_is_never_returned() {
        let (_dir, store) = temp_store();
        let project = sample_project(35.0);
        store.save(&project).unwrap();

        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "UPDATE projects
             SET body = CAST(REPLACE(CAST(body AS TEXT), '35.0', '99.0') AS BLOB)
             WHERE id = ?1",
            params![project.id],
        )
        .unwrap();

        let err = store.load(&project.id).unwrap_err();
        assert_eq!(err.error_code(), "DATA_CORRUPTED");
    }

    #[test]
    fn test_malformed_body_with_matching_checksum_is_corrupt() {
        let (_dir, store) = temp_store();
        let project = sample_project(35.0);
        store.save(&project).unwrap();

        let garbage = b"{not json".to_vec();
        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "UPDATE projects SET body = ?1, checksum = ?2 WHERE id = ?3",
            params![garbage, integrity::checksum(&garbage), project.id],
        )
        .unwrap();

        assert_eq!(store.load(&project.id).unwrap_err().error_code(), "DATA_CORRUPTED");
    }

    #[test]
    fn test_delete_is_idempotent_and_cascades() {
        let (_dir, store) = temp_store();
        let project = sample_project(35.0);
        let saved = store.save(&project).unwrap();
        store
            .create_checkpoint(&Checkpoint::new(CheckpointOperation::Manual, saved).unwrap())
            .unwrap();
        assert_eq!(store.checkpoint_count(&project.id).unwrap(), 1);

        assert!(store.delete(&project.id).unwrap());
        assert!(!store.delete(&project.id).unwrap());
        assert!(store.load(&project.id).unwrap().is_none());
        assert_eq!(store.checkpoint_count(&project.id).unwrap(), 0);
    }

    #[test]
    fn test_checkpoints_listed_newest_first() {
        let (_dir, store) = temp_store();
        let mut project = store.save(&sample_project(35.0)).unwrap();
        let mut ids = Vec::new();
        for snow in [35.0, 40.0, 45.0] {
            project.inputs = json!({"groundSnowLoad": snow});
            let checkpoint =
                Checkpoint::new(CheckpointOperation::DataChange, project.clone()).unwrap();
            store.create_checkpoint(&checkpoint).unwrap();
            ids.push(checkpoint.id);
        }

        let listed = store.list_checkpoints(&project.id, 10).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[0].data.input_f64("groundSnowLoad"), Some(45.0));
        assert_eq!(listed[2].id, ids[0]);

        assert_eq!(store.list_checkpoints(&project.id, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_list_checkpoints_reads_past_corrupt_rows() {
        let (_dir, store) = temp_store();
        let saved = store.save(&sample_project(35.0)).unwrap();
        let mut ids = Vec::new();
        for _ in 0..20 {
            let checkpoint = Checkpoint::new(CheckpointOperation::AutoSave, saved.clone()).unwrap();
            store.create_checkpoint(&checkpoint).unwrap();
            ids.push(checkpoint.id);
        }
        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "UPDATE checkpoints SET checksum = 'deadbeef' WHERE id NOT IN (?1, ?2, ?3)",
            params![ids[0], ids[1], ids[2]],
        )
        .unwrap();

        let listed = store.list_checkpoints(&saved.id, 2).unwrap();
        let listed: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(listed, vec![ids[2].as_str(), ids[1].as_str()]);
        assert_eq!(store.list_checkpoints(&saved.id, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_computed_floats_verify_after_storage() {
        let (dir, store) = temp_store();
        let files = crate::crash::CrashFiles::new(dir.path());
        for i in 0..100 {
            let ground = 10.0 + i as f64 * 0.37;
            let project = sample_project(ground)
                .with_results(json!({"roofSnowLoad": ground * 0.7 * 1.1 / 3.0}));
            let saved = store.save(&project).unwrap();
            assert_eq!(store.load(&saved.id).unwrap().unwrap(), saved);

            let checkpoint = Checkpoint::new(CheckpointOperation::AutoSave, saved.clone()).unwrap();
            store.create_checkpoint(&checkpoint).unwrap();
            let restored = store.restore_checkpoint(&checkpoint.id).unwrap().unwrap();
            assert_eq!(restored.data, saved);

            let backup = crate::crash::StateBackup::new(saved.clone(), "Auto-save");
            files.write_backup(&backup).unwrap();
            assert_eq!(files.read_backup().unwrap().unwrap().project_data, saved);
        }
    }

    #[test]
    fn test_checkpoint_requires_existing_project() {
        let (_dir, store) = temp_store();
        let checkpoint =
            Checkpoint::new(CheckpointOperation::Manual, sample_project(35.0)).unwrap();
        let err = store.create_checkpoint(&checkpoint).unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_restore_checkpoint_verifies_snapshot() {
        let (_dir, store) = temp_store();
        let saved = store.save(&sample_project(35.0)).unwrap();
        let checkpoint = Checkpoint::new(CheckpointOperation::Manual, saved).unwrap();
        store.create_checkpoint(&checkpoint).unwrap();

        let restored = store.restore_checkpoint(&checkpoint.id).unwrap().unwrap();
        assert_eq!(restored.data, checkpoint.data);
        assert_eq!(restored.operation, CheckpointOperation::Manual);
        assert!(store.restore_checkpoint("missing").unwrap().is_none());

        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "UPDATE checkpoints
             SET snapshot = CAST(REPLACE(CAST(snapshot AS TEXT), 'Warehouse', 'Warehousf') AS BLOB)
             WHERE id = ?1",
            params![checkpoint.id],
        )
        .unwrap();
        assert_eq!(
            store.restore_checkpoint(&checkpoint.id).unwrap_err().error_code(),
            "DATA_CORRUPTED"
        );
        assert!(store.list_checkpoints(&checkpoint.project_id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_dir, store) = temp_store();
        let saved = store.save(&sample_project(35.0)).unwrap();
        let mut last = String::new();
        for _ in 0..5 {
            let checkpoint = Checkpoint::new(CheckpointOperation::AutoSave, saved.clone()).unwrap();
            store.create_checkpoint(&checkpoint).unwrap();
            last = checkpoint.id;
        }
        assert_eq!(store.prune_checkpoints(&saved.id, 2).unwrap(), 3);
        let remaining = store.list_checkpoints(&saved.id, 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, last);
    }

    #[test]
    fn test_idempotency_keys_expire() {
        let (_dir, store) = temp_store();
        assert!(!store.is_operation_completed("k1").unwrap());

        store
            .mark_operation_completed("k1", "create_project", "\"p-1\"", Duration::from_secs(3600))
            .unwrap();
        assert!(store.is_operation_completed("k1").unwrap());
        let record = store.completed_result("k1").unwrap().unwrap();
        assert_eq!(record.operation, "create_project");
        assert_eq!(record.result, "\"p-1\"");

        store
            .mark_operation_completed("k2", "create_project", "null", Duration::from_secs(0))
            .unwrap();
        assert!(!store.is_operation_completed("k2").unwrap());
        assert_eq!(store.purge_expired_keys().unwrap(), 1);
        assert!(store.is_operation_completed("k1").unwrap());
    }

    #[test]
    fn test_settings_roundtrip() {
        let (_dir, store) = temp_store();
        assert!(store.get_setting("units").unwrap().is_none());
        store.set_setting("units", "imperial").unwrap();
        store.set_setting("units", "metric").unwrap();
        assert_eq!(store.get_setting("units").unwrap().as_deref(), Some("metric"));

        store.set_setting_json("recent", &vec!["a", "b"]).unwrap();
        let recent: Vec<String> = store.get_setting_json("recent").unwrap().unwrap();
        assert_eq!(recent, vec!["a", "b"]);
    }

    #[test]
    fn test_health_report() {
        let (_dir, store) = temp_store();
        store.save(&sample_project(35.0)).unwrap();
        let health = store.health().unwrap();
        assert_eq!(health.schema_version, SCHEMA_VERSION);
        assert_eq!(health.project_count, 1);
        assert_eq!(health.checkpoint_count, 0);
        assert_eq!(health.journal_mode, "wal");
        assert!(health.integrity_ok);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let (dir, store) = temp_store();
        let conn = Connection::open(store.path()).unwrap();
        conn.execute("UPDATE store_meta SET version = ?1", params![SCHEMA_VERSION + 1]).unwrap();
        drop(conn);

        let err = PersistentStore::open(&dir.path().join("stratify.db"), StoreConfig::default())
            .unwrap_err();
        assert_eq!(err.error_code(), "VERSION_MISMATCH");
    }

    #[test]
    fn test_concurrent_saves_of_distinct_projects() {
        let (_dir, store) = temp_store();
        let projects: Vec<ProjectRecord> = (0..20)
            .map(|i| {
                ProjectRecord::new(format!("Project {}", i), format!("Building {}", i))
                    .with_inputs(json!({"groundSnowLoad": 20.0 + i as f64}))
            })
            .collect();

        std::thread::scope(|scope| {
            for project in &projects {
                let store = store.clone();
                scope.spawn(move || store.save(project).unwrap());
            }
        });

        let mut seen = HashSet::new();
        for (i, project) in projects.iter().enumerate() {
            let loaded = store.load(&project.id).unwrap().unwrap();
            assert!(loaded.verify_checksum());
            assert_eq!(loaded.name, format!("Project {}", i));
            assert_eq!(loaded.input_f64("groundSnowLoad"), Some(20.0 + i as f64));
            assert!(seen.insert(loaded.checksum.clone()));
        }
        assert_eq!(store.list_projects().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_offload_runs_store_work_off_the_runtime() {
        let (_dir, store) = temp_store();
        let project = sample_project(35.0);
        let saver = store.clone();
        let saved = offload("save project", move || saver.save(&project)).await.unwrap();

        let loader = store.clone();
        let id = saved.id.clone();
        let loaded = offload("load project", move || loader.load(&id)).await.unwrap();
        assert_eq!(loaded, Some(saved));
    }
}
