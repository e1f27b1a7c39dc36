//! # Crash-Recovery Files
//!
//! Files kept next to the database but outside its transactions, so they
//! stay inspectable even when the store itself cannot be opened:
//!
//! - **`crash.marker`**: RFC 3339 timestamp written at startup and removed on
//!   clean shutdown. Finding it at startup means the last run did not exit
//!   cleanly.
//! - **`state_backup.json`**: the latest full project snapshot, refreshed by
//!   auto-save and change tracking.
//! - **`store.lock`**: exclusive OS lock (via fs2) plus holder metadata, so
//!   only one process writes to a data directory at a time.
//!
//! Marker and backup are written atomically: temp file, fsync, rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{StoreError, StoreResult};
use crate::project::ProjectRecord;

pub const CRASH_MARKER_FILE: &str = "crash.marker";
pub const STATE_BACKUP_FILE: &str = "state_backup.json";
pub const LOCK_FILE: &str = "store.lock";

/// Header of the state backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// When the backup was written
    pub auto_saved: DateTime<Utc>,
    pub description: String,
}

/// Full-state backup written outside the transactional store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBackup {
    pub project_info: BackupInfo,
    pub project_data: ProjectRecord,
}

impl StateBackup {
    pub fn new(project: ProjectRecord, description: impl Into<String>) -> Self {
        StateBackup {
            project_info: BackupInfo {
                auto_saved: Utc::now(),
                description: description.into(),
            },
            project_data: project,
        }
    }
}

/// Evidence that the previous run terminated abnormally.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousCrash {
    /// Timestamp the crashed run wrote at its startup, if readable
    pub started_at: Option<DateTime<Utc>>,
    pub backup: StateBackup,
}

/// Paths of the crash-recovery files inside one state directory.
#[derive(Debug, Clone)]
pub struct CrashFiles {
    dir: PathBuf,
}

impl CrashFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CrashFiles { dir: dir.into() }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(CRASH_MARKER_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Write the crash marker with the current time.
    pub fn write_marker(&self) -> StoreResult<DateTime<Utc>> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StoreError::from_io("create state directory", self.dir.display().to_string(), &e)
        })?;
        let now = Utc::now();
        atomic_write(&self.marker_path(), now.to_rfc3339().as_bytes())?;
        Ok(now)
    }

    pub fn marker_exists(&self) -> bool {
        self.marker_path().exists()
    }

    /// Timestamp stored in the marker; `None` if absent or unreadable.
    pub fn read_marker(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Remove the crash marker. Already absent is fine.
    pub fn clear_marker(&self) -> StoreResult<()> {
        remove_if_exists(&self.marker_path(), "remove crash marker")
    }

    /// Atomically replace the state backup.
    pub fn write_backup(&self, backup: &StateBackup) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(backup).map_err(StoreError::serialization)?;
        atomic_write(&self.backup_path(), json.as_bytes())
    }

    /// Read the state backup.
    ///
    /// `Ok(None)` if there is none; `DataCorrupted` if it cannot be parsed
    /// or its embedded project fails checksum verification.
    pub fn read_backup(&self) -> StoreResult<Option<StateBackup>> {
        let path = self.backup_path();
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::from_io(
                    "read state backup",
                    path.display().to_string(),
                    &e,
                ))
            }
        };
        let mut value: Value = serde_json::from_slice(&contents).map_err(|e| {
            StoreError::data_corrupted(STATE_BACKUP_FILE, format!("invalid backup JSON: {}", e))
        })?;
        let (Some(info), Some(data)) = (
            value.get_mut("project_info").map(Value::take),
            value.get_mut("project_data").map(Value::take),
        ) else {
            return Err(StoreError::data_corrupted(
                STATE_BACKUP_FILE,
                "backup is missing project_info or project_data",
            ));
        };
        let project_info: BackupInfo = serde_json::from_value(info).map_err(|e| {
            StoreError::data_corrupted(STATE_BACKUP_FILE, format!("invalid backup header: {}", e))
        })?;
        let project_data = ProjectRecord::from_sealed_value(STATE_BACKUP_FILE, data)?;
        Ok(Some(StateBackup {
            project_info,
            project_data,
        }))
    }

    pub fn remove_backup(&self) -> StoreResult<()> {
        remove_if_exists(&self.backup_path(), "remove state backup")
    }

    /// Inspect the files left by the previous run.
    ///
    /// A crash is reported only when both the marker and a readable backup
    /// exist. Nothing is restored here.
    pub fn check_previous_crash(&self) -> Option<PreviousCrash> {
        if !self.marker_exists() {
            return None;
        }
        match self.read_backup() {
            Ok(Some(backup)) => Some(PreviousCrash {
                started_at: self.read_marker(),
                backup,
            }),
            Ok(None) => {
                tracing::info!("crash marker found without a state backup; nothing to recover");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "crash marker found but the state backup is unusable");
                None
            }
        }
    }
}

/// Write `bytes` to `path` via a synced temp file and a rename.
///
/// Readers see either the old file or the complete new one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp_path = tmp_path_for(path);

    let mut tmp_file = File::create(&tmp_path)
        .map_err(|e| StoreError::from_io("create temp file", tmp_path.display().to_string(), &e))?;

    tmp_file
        .write_all(bytes)
        .map_err(|e| StoreError::from_io("write temp file", tmp_path.display().to_string(), &e))?;

    tmp_file
        .sync_all()
        .map_err(|e| StoreError::from_io("sync temp file", tmp_path.display().to_string(), &e))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::from_io("rename to final", path.display().to_string(), &e)
    })?;

    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path, operation: &str) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::from_io(operation, path.display().to_string(), &e)),
    }
}

/// Who holds a state directory, as recorded in its lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub label: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive writer guard on a state directory.
///
/// The fs2 lock is what keeps other processes out; it goes away with its
/// holder, so a crashed process never blocks a restart. The file body only
/// names the holder. Releasing empties the body but keeps the file, so a
/// process waiting on the lock never ends up holding an unlinked inode.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
    holder: LockHolder,
}

impl InstanceLock {
    /// Take the lock at `path`, or fail with `FileLocked` naming the holder.
    pub fn acquire(path: &Path, label: impl Into<String>) -> StoreResult<Self> {
        let path_str = path.display().to_string();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::from_io("open lock file", &path_str, &e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(match Self::holder(path) {
                Some(held) => StoreError::file_locked(
                    &path_str,
                    format!("{} (pid {})", held.label, held.pid),
                    held.acquired_at.to_rfc3339(),
                ),
                None => StoreError::file_locked(&path_str, "another process", "unknown"),
            });
        }

        // A body survives only when its writer never released the lock.
        let mut previous = String::new();
        if file.read_to_string(&mut previous).is_ok() {
            if let Ok(abandoned) = serde_json::from_str::<LockHolder>(&previous) {
                tracing::warn!(
                    label = %abandoned.label,
                    pid = abandoned.pid,
                    acquired_at = %abandoned.acquired_at,
                    "previous holder exited without releasing the state directory"
                );
            }
        }

        let holder = LockHolder {
            label: label.into(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&holder).map_err(StoreError::serialization)?;
        replace_body(&mut file, &body)
            .map_err(|e| StoreError::from_io("write lock file", &path_str, &e))?;

        Ok(InstanceLock {
            path: path.to_path_buf(),
            file,
            holder,
        })
    }

    /// Holder recorded at `path`; `None` when unheld or unreadable.
    pub fn holder(path: &Path) -> Option<LockHolder> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn held_by(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = replace_body(&mut self.file, b"") {
            tracing::debug!(path = %self.path.display(), error = %e, "could not clear lock file");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

fn replace_body(file: &mut File, body: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(body)?;
    file.sync_all()
}
