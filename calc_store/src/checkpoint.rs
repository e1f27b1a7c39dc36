//! # Checkpoint Manager
//!
//! Orchestrates snapshots of open projects:
//! - **Triggered checkpoints**: manual saves, detected changes, forced flushes
//! - **Auto-save**: a background worker checkpoints every active project whose
//!   last checkpoint is older than the configured interval
//! - **Crash lifecycle**: crash marker at startup, state backup while running,
//!   emergency flush and cleanup on shutdown
//! - **Recovery discovery**: lists backup, checkpoints and the last good
//!   stored state for the caller to choose from; nothing is restored
//!   automatically
//!
//! Projects move `Inactive -> Active` with [`CheckpointManager::mark_active`]
//! and back with [`CheckpointManager::mark_inactive`]. Only active projects
//! take part in auto-save and emergency flushes, and per-project tracking
//! state is dropped when a project goes inactive.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use calc_store::checkpoint::CheckpointManager;
//! use calc_store::config::{CheckpointConfig, StoreConfig};
//! use calc_store::project::CheckpointOperation;
//! use calc_store::store::PersistentStore;
//! use std::path::Path;
//!
//! # async fn demo() -> calc_store::errors::StoreResult<()> {
//! let store = PersistentStore::open(Path::new("data/stratify.db"), StoreConfig::default())?;
//! let manager = Arc::new(CheckpointManager::new(store, "data", CheckpointConfig::default()));
//! let report = manager.initialize()?;
//! if let Some(crash) = report.previous_crash {
//!     println!("previous run crashed; backup of {}", crash.backup.project_data.name);
//! }
//! manager.mark_active("some-project-id");
//! manager.create_checkpoint("some-project-id", CheckpointOperation::Manual, None)?;
//! manager.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::change::ChangeDetector;
use crate::config::CheckpointConfig;
use crate::crash::{CrashFiles, InstanceLock, PreviousCrash, StateBackup};
use crate::errors::{StoreError, StoreResult};
use crate::project::{Checkpoint, CheckpointOperation, ProjectRecord};
use crate::store::PersistentStore;

/// Published to subscribers after every successful checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub checkpoint_id: String,
    pub project_id: String,
    pub operation: CheckpointOperation,
    pub timestamp: DateTime<Utc>,
    pub data_size: u64,
}

/// Result of [`CheckpointManager::initialize`].
#[derive(Debug, Clone)]
pub struct StartupReport {
    /// Set when the previous run left a crash marker and a state backup
    pub previous_crash: Option<PreviousCrash>,
    /// Timestamp written into this run's crash marker
    pub marker_written_at: DateTime<Utc>,
    /// Whether the background auto-save worker was started
    pub autosave_started: bool,
}

/// Where a recovery option comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoverySource {
    StateBackup,
    Checkpoint {
        checkpoint_id: String,
        operation: CheckpointOperation,
    },
    LastGoodState,
}

/// One entry in the recovery list shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOption {
    pub source: RecoverySource,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub project: ProjectRecord,
}

/// Outcome of one auto-save pass.
#[derive(Debug, Default)]
pub struct AutoSaveSummary {
    pub checkpointed: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
    /// Active projects whose last checkpoint was still fresh
    pub not_due: usize,
}

/// Outcome of an emergency flush.
#[derive(Debug, Default)]
pub struct EmergencySummary {
    pub checkpointed: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
    /// Another flush was already running, so this call did nothing
    pub already_running: bool,
}

#[derive(Debug, Default)]
struct TrackingState {
    active: HashSet<String>,
    last_checkpoint: HashMap<String, Instant>,
    detector: ChangeDetector,
}

/// Background auto-save task; stopped when dropped.
struct AutosaveWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl AutosaveWorker {
    fn spawn(
        runtime: &tokio::runtime::Handle,
        manager: Weak<CheckpointManager>,
        tick: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join_handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(tick) => {
                        let Some(manager) = manager.upgrade() else { break };
                        let pass =
                            tokio::task::spawn_blocking(move || manager.run_autosave_pass());
                        if let Err(err) = pass.await {
                            tracing::error!(error = %err, "auto-save pass panicked");
                        }
                    }
                }
            }
            tracing::debug!("auto-save worker stopped");
        });
        AutosaveWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl Drop for AutosaveWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hooks installed by [`CheckpointManager::install_emergency_handlers`].
///
/// Dropping it stops the Ctrl-C watcher. The chained panic hook stays in
/// place but does nothing once the manager is gone.
#[must_use = "dropping the handlers stops the Ctrl-C watcher"]
pub struct EmergencyHandlers {
    signal_task: Option<JoinHandle<()>>,
}

impl EmergencyHandlers {
    pub fn watches_interrupt(&self) -> bool {
        self.signal_task.is_some()
    }
}

impl Drop for EmergencyHandlers {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

/// Checkpoint orchestration for one data directory.
pub struct CheckpointManager {
    store: PersistentStore,
    files: CrashFiles,
    state_dir: PathBuf,
    config: CheckpointConfig,
    tracking: Mutex<TrackingState>,
    events: broadcast::Sender<CheckpointEvent>,
    worker: Mutex<Option<AutosaveWorker>>,
    instance_lock: Mutex<Option<InstanceLock>>,
    /// Held for the duration of an auto-save pass
    autosave_pass: Mutex<()>,
    flush_in_progress: AtomicBool,
    shut_down: AtomicBool,
}

impl CheckpointManager {
    pub fn new(
        store: PersistentStore,
        state_dir: impl Into<PathBuf>,
        config: CheckpointConfig,
    ) -> Self {
        let state_dir = state_dir.into();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        CheckpointManager {
            store,
            files: CrashFiles::new(state_dir.clone()),
            state_dir,
            config,
            tracking: Mutex::new(TrackingState::default()),
            events,
            worker: Mutex::new(None),
            instance_lock: Mutex::new(None),
            autosave_pass: Mutex::new(()),
            flush_in_progress: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn crash_files(&self) -> &CrashFiles {
        &self.files
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Receive a [`CheckpointEvent`] for every checkpoint created from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointEvent> {
        self.events.subscribe()
    }

    fn tracking(&self) -> MutexGuard<'_, TrackingState> {
        // Tracking state stays consistent even if a holder panicked.
        self.tracking.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start a run: lock the state directory, look for a previous crash,
    /// write a fresh crash marker and start the auto-save worker.
    ///
    /// The worker is only started when called inside a tokio runtime.
    pub fn initialize(self: &Arc<Self>) -> StoreResult<StartupReport> {
        let health = self.store.health()?;
        if !health.integrity_ok {
            tracing::warn!(
                detail = %health.integrity_detail,
                "store quick_check reported problems"
            );
        }

        std::fs::create_dir_all(&self.state_dir).map_err(|e| {
            StoreError::from_io("create state directory", self.state_dir.display().to_string(), &e)
        })?;
        let lock = InstanceLock::acquire(&self.files.lock_path(), "calc_store")?;
        *self.instance_lock.lock().unwrap_or_else(|p| p.into_inner()) = Some(lock);

        let previous_crash = self.files.check_previous_crash();
        if let Some(crash) = &previous_crash {
            tracing::warn!(
                project_id = %crash.backup.project_data.id,
                backup_saved = %crash.backup.project_info.auto_saved,
                "previous run did not shut down cleanly; recovery available"
            );
        }
        let marker_written_at = self.files.write_marker()?;
        self.shut_down.store(false, Ordering::SeqCst);

        let autosave_started = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let worker = AutosaveWorker::spawn(
                    &runtime,
                    Arc::downgrade(self),
                    self.config.worker_tick(),
                );
                *self.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(worker);
                true
            }
            Err(_) => {
                tracing::warn!("no tokio runtime; auto-save worker not started");
                false
            }
        };

        tracing::info!(
            projects = health.project_count,
            checkpoints = health.checkpoint_count,
            autosave_started,
            "checkpoint manager initialized"
        );
        Ok(StartupReport {
            previous_crash,
            marker_written_at,
            autosave_started,
        })
    }

    /// Clean exit: stop the worker, flush every active project, then remove
    /// the crash marker and the state backup. Later calls do nothing.
    ///
    /// An auto-save pass already running on the blocking pool is waited for.
    pub fn shutdown(&self) -> StoreResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut worker) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            worker.stop();
        }
        let _no_pass = self.autosave_pass.lock().unwrap_or_else(|p| p.into_inner());

        let summary = self.emergency_checkpoint_all();
        if !summary.failed.is_empty() {
            tracing::warn!(
                failed = summary.failed.len(),
                "some projects were not flushed at shutdown"
            );
        }

        let marker = self.files.clear_marker();
        let backup = self.files.remove_backup();
        self.instance_lock.lock().unwrap_or_else(|p| p.into_inner()).take();

        tracing::info!(flushed = summary.checkpointed.len(), "checkpoint manager shut down");
        marker.and(backup)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Flush active projects when the process panics or is interrupted.
    ///
    /// The panic hook runs an emergency flush on every panic, then the hook
    /// that was installed before. Ctrl-C is watched only inside a tokio
    /// runtime: it shuts the manager down (which flushes) and exits the
    /// process with status 130.
    pub fn install_emergency_handlers(self: &Arc<Self>) -> EmergencyHandlers {
        let manager = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(manager) = manager.upgrade() {
                let summary = manager.emergency_checkpoint_all();
                tracing::error!(
                    checkpointed = summary.checkpointed.len(),
                    failed = summary.failed.len(),
                    "panic: emergency checkpoint of active projects"
                );
            }
            previous(info);
        }));

        let signal_task = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = Arc::downgrade(self);
                Some(runtime.spawn(async move {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %err, "cannot watch for Ctrl-C");
                        return;
                    }
                    let Some(manager) = manager.upgrade() else { return };
                    tracing::warn!("interrupted; flushing active projects");
                    match tokio::task::spawn_blocking(move || manager.shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::error!(error = %err, "shutdown after interrupt failed")
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "shutdown after interrupt panicked")
                        }
                    }
                    std::process::exit(130);
                }))
            }
            Err(_) => {
                tracing::debug!("no tokio runtime; Ctrl-C is not watched");
                None
            }
        };
        EmergencyHandlers { signal_task }
    }

    // ------------------------------------------------------------------
    // Active set
    // ------------------------------------------------------------------

    pub fn mark_active(&self, project_id: &str) {
        let mut tracking = self.tracking();
        tracking.active.insert(project_id.to_string());
        tracking
            .last_checkpoint
            .entry(project_id.to_string())
            .or_insert_with(Instant::now);
    }

    /// Deactivate a project and drop all of its tracking state.
    pub fn mark_inactive(&self, project_id: &str) {
        let mut tracking = self.tracking();
        tracking.active.remove(project_id);
        tracking.last_checkpoint.remove(project_id);
        tracking.detector.clear(project_id);
    }

    pub fn is_active(&self, project_id: &str) -> bool {
        self.tracking().active.contains(project_id)
    }

    /// Active project ids, sorted.
    pub fn active_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracking().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget change-detection history and the last checkpoint time, so the
    /// next observation checkpoints and the project is due for auto-save.
    pub fn clear_tracking(&self, project_id: &str) {
        let mut tracking = self.tracking();
        tracking.detector.clear(project_id);
        tracking.last_checkpoint.remove(project_id);
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Snapshot a project and return the checkpoint id.
    ///
    /// Without `data` the current stored record is used. Excess checkpoints
    /// are pruned afterwards; a pruning failure is logged only.
    pub fn create_checkpoint(
        &self,
        project_id: &str,
        operation: CheckpointOperation,
        data: Option<ProjectRecord>,
    ) -> StoreResult<String> {
        let data = match data {
            Some(record) if record.id != project_id => {
                return Err(StoreError::validation_failed(
                    "data.id",
                    record.id,
                    format!("snapshot does not belong to project '{}'", project_id),
                ));
            }
            Some(record) => record,
            None => self
                .store
                .load(project_id)?
                .ok_or_else(|| StoreError::not_found("project", project_id))?,
        };

        let checkpoint = Checkpoint::new(operation, data)?;
        self.store.create_checkpoint(&checkpoint)?;

        {
            let mut tracking = self.tracking();
            if tracking.active.contains(project_id) {
                tracking.last_checkpoint.insert(project_id.to_string(), Instant::now());
            }
        }

        match self.store.prune_checkpoints(project_id, self.config.max_checkpoints_per_project) {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(project_id, pruned, "pruned old checkpoints"),
            Err(err) => tracing::warn!(project_id, error = %err, "checkpoint pruning failed"),
        }

        tracing::info!(
            project_id,
            checkpoint_id = %checkpoint.id,
            operation = %operation,
            data_size = checkpoint.data_size,
            "checkpoint created"
        );
        let _ = self.events.send(CheckpointEvent {
            checkpoint_id: checkpoint.id.clone(),
            project_id: project_id.to_string(),
            operation,
            timestamp: checkpoint.timestamp,
            data_size: checkpoint.data_size,
        });
        Ok(checkpoint.id)
    }

    /// Checkpoint the stored state of one project right now.
    pub fn flush(&self, project_id: &str) -> StoreResult<String> {
        self.create_checkpoint(project_id, CheckpointOperation::ForcedFlush, None)
    }

    /// Checkpoint `state` if it differs from the last tracked state.
    ///
    /// Returns the checkpoint id when one was taken.
    pub fn track_data_change(
        &self,
        project_id: &str,
        state: &ProjectRecord,
        force: bool,
    ) -> StoreResult<Option<String>> {
        let significant = {
            let mut tracking = self.tracking();
            let changed = tracking
                .detector
                .has_significant_change(project_id, &tracked_state(state))?;
            force || changed
        };
        if !significant {
            return Ok(None);
        }

        let operation = CheckpointOperation::DataChange;
        match self.create_checkpoint(project_id, operation, Some(state.clone())) {
            Ok(checkpoint_id) => {
                self.refresh_backup(state, "Data change");
                Ok(Some(checkpoint_id))
            }
            Err(err) => {
                // Forget the hash so the same state is checkpointed next time.
                self.tracking().detector.clear(project_id);
                Err(err)
            }
        }
    }

    /// Take an `auto_save` checkpoint of every active project that is due.
    ///
    /// Failures are logged per project and never stop the pass.
    pub fn run_autosave_pass(&self) -> AutoSaveSummary {
        let _pass = self.autosave_pass.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_shut_down() {
            return AutoSaveSummary::default();
        }
        let interval = self.config.autosave_interval();
        let (due, not_due) = {
            let tracking = self.tracking();
            let mut due = Vec::new();
            let mut not_due = 0;
            for id in &tracking.active {
                let fresh = tracking
                    .last_checkpoint
                    .get(id)
                    .map(|last| last.elapsed() < interval)
                    .unwrap_or(false);
                if fresh {
                    not_due += 1;
                } else {
                    due.push(id.clone());
                }
            }
            (due, not_due)
        };

        let mut summary = AutoSaveSummary {
            not_due,
            ..AutoSaveSummary::default()
        };
        for project_id in due {
            if self.is_shut_down() {
                tracing::debug!("shutdown started; auto-save pass stopped early");
                break;
            }
            match self.checkpoint_stored(&project_id, CheckpointOperation::AutoSave, "Auto-save") {
                Ok(_) => summary.checkpointed.push(project_id),
                Err(err) => {
                    tracing::error!(project_id = %project_id, error = %err, "auto-save failed");
                    summary.failed.push((project_id, err));
                }
            }
        }

        match self.store.purge_expired_keys() {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "purged expired idempotency keys"),
            Err(err) => tracing::warn!(error = %err, "idempotency key purge failed"),
        }

        if !summary.checkpointed.is_empty() || !summary.failed.is_empty() {
            tracing::info!(
                checkpointed = summary.checkpointed.len(),
                failed = summary.failed.len(),
                "auto-save pass finished"
            );
        }
        summary
    }

    /// Force-checkpoint every active project. Never fails.
    ///
    /// Overlapping calls (e.g. two termination signals in a row) are
    /// collapsed: only the first one writes.
    pub fn emergency_checkpoint_all(&self) -> EmergencySummary {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("emergency flush already running");
            return EmergencySummary {
                already_running: true,
                ..EmergencySummary::default()
            };
        }

        let mut summary = EmergencySummary::default();
        for project_id in self.active_projects() {
            let operation = CheckpointOperation::Emergency;
            match self.checkpoint_stored(&project_id, operation, "Emergency save") {
                Ok(_) => summary.checkpointed.push(project_id),
                Err(err) => {
                    tracing::error!(
                        project_id = %project_id,
                        error = %err,
                        "emergency checkpoint failed"
                    );
                    summary.failed.push((project_id, err));
                }
            }
        }

        self.flush_in_progress.store(false, Ordering::SeqCst);
        summary
    }

    /// Load the stored record, checkpoint it and refresh the state backup.
    fn checkpoint_stored(
        &self,
        project_id: &str,
        operation: CheckpointOperation,
        description: &str,
    ) -> StoreResult<String> {
        let record = self
            .store
            .load(project_id)?
            .ok_or_else(|| StoreError::not_found("project", project_id))?;
        let checkpoint_id = self.create_checkpoint(project_id, operation, Some(record.clone()))?;
        self.refresh_backup(&record, description);
        Ok(checkpoint_id)
    }

    fn refresh_backup(&self, record: &ProjectRecord, description: &str) {
        // The backup must not outlive a clean exit.
        if self.is_shut_down() {
            return;
        }
        let mut snapshot = record.clone();
        if !snapshot.verify_checksum() {
            if let Err(err) = snapshot.seal() {
                tracing::warn!(
                    project_id = %record.id,
                    error = %err,
                    "could not seal state backup"
                );
                return;
            }
        }
        if let Err(err) = self.files.write_backup(&StateBackup::new(snapshot, description)) {
            tracing::warn!(project_id = %record.id, error = %err, "state backup refresh failed");
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Everything a project could be recovered from, for presentation.
    ///
    /// Order: state backup (if it holds this project), then the most recent
    /// checkpoints newest first, then the current stored record if it
    /// verifies.
    pub fn get_recovery_options(&self, project_id: &str) -> StoreResult<Vec<RecoveryOption>> {
        let mut options = Vec::new();

        match self.files.read_backup() {
            Ok(Some(backup)) if backup.project_data.id == project_id => {
                options.push(RecoveryOption {
                    source: RecoverySource::StateBackup,
                    description: format!("State backup ({})", backup.project_info.description),
                    timestamp: backup.project_info.auto_saved,
                    project: backup.project_data,
                })
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(project_id, error = %err, "state backup unusable for recovery")
            }
        }

        let limit = self.config.recovery_option_limit;
        for checkpoint in self.store.list_checkpoints(project_id, limit)? {
            options.push(RecoveryOption {
                description: format!(
                    "{} checkpoint (version {})",
                    checkpoint.operation.label(),
                    checkpoint.data.version
                ),
                source: RecoverySource::Checkpoint {
                    checkpoint_id: checkpoint.id,
                    operation: checkpoint.operation,
                },
                timestamp: checkpoint.timestamp,
                project: checkpoint.data,
            });
        }

        match self.store.load(project_id) {
            Ok(Some(record)) => options.push(RecoveryOption {
                source: RecoverySource::LastGoodState,
                description: format!("Last saved state (version {})", record.version),
                timestamp: record.updated_at,
                project: record,
            }),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(project_id, error = %err, "stored record not offered for recovery")
            }
        }

        Ok(options)
    }

    /// The project snapshot held by a checkpoint.
    ///
    /// `None` when the checkpoint is missing or fails integrity checks;
    /// callers treat that as "recovery unavailable".
    pub fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Option<ProjectRecord> {
        match self.store.restore_checkpoint(checkpoint_id) {
            Ok(Some(checkpoint)) => Some(checkpoint.data),
            Ok(None) => {
                tracing::info!(checkpoint_id, "checkpoint not found");
                None
            }
            Err(err) => {
                tracing::warn!(checkpoint_id, error = %err, "checkpoint cannot be restored");
                None
            }
        }
    }
}

/// The part of a record that counts as a change: metadata bookkeeping
/// (timestamps, version, checksum) is left out.
fn tracked_state(record: &ProjectRecord) -> Value {
    json!({
        "name": record.name,
        "description": record.description,
        "geometry": record.geometry,
        "inputs": record.inputs,
        "results": record.results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    fn setup(config: CheckpointConfig) -> (TempDir, Arc<CheckpointManager>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PersistentStore::open(&dir.path().join("stratify.db"), StoreConfig::default()).unwrap();
        let manager = Arc::new(CheckpointManager::new(store, dir.path(), config));
        (dir, manager)
    }

    fn saved_project(manager: &CheckpointManager, snow: f64) -> ProjectRecord {
        let project = ProjectRecord::new("Warehouse", "Roof snow check")
            .with_inputs(json!({"groundSnowLoad": snow}));
        manager.store().save(&project).unwrap()
    }

    fn immediate_autosave() -> CheckpointConfig {
        CheckpointConfig {
            autosave_interval_secs: 0,
            ..CheckpointConfig::default()
        }
    }

    #[test]
    fn test_create_checkpoint_loads_current_state() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);

        let id = manager.create_checkpoint(&project.id, CheckpointOperation::Manual, None).unwrap();
        let restored = manager.restore_from_checkpoint(&id).unwrap();
        assert_eq!(restored, project);
    }

    #[test]
    fn test_create_checkpoint_for_missing_project_fails() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let err = manager
            .create_checkpoint("missing", CheckpointOperation::Manual, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_create_checkpoint_rejects_foreign_snapshot() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);
        let other = saved_project(&manager, 40.0);
        let err = manager
            .create_checkpoint(&project.id, CheckpointOperation::Manual, Some(other))
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn test_checkpoint_cap_is_enforced() {
        let (_dir, manager) = setup(CheckpointConfig {
            max_checkpoints_per_project: 3,
            ..CheckpointConfig::default()
        });
        let project = saved_project(&manager, 35.0);
        for _ in 0..6 {
            manager.create_checkpoint(&project.id, CheckpointOperation::Manual, None).unwrap();
        }
        assert_eq!(manager.store().checkpoint_count(&project.id).unwrap(), 3);
    }

    #[test]
    fn test_events_are_published() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);
        let mut events = manager.subscribe();

        let id = manager.flush(&project.id).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.checkpoint_id, id);
        assert_eq!(event.project_id, project.id);
        assert_eq!(event.operation, CheckpointOperation::ForcedFlush);
    }

    #[test]
    fn test_track_data_change_only_on_change() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let mut project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);

        assert!(manager.track_data_change(&project.id, &project, false).unwrap().is_some());
        assert!(manager.track_data_change(&project.id, &project, false).unwrap().is_none());
        assert!(manager.track_data_change(&project.id, &project, true).unwrap().is_some());

        project.inputs = json!({"groundSnowLoad": 45.0});
        project.touch();
        let project = manager.store().save(&project).unwrap();
        assert!(manager.track_data_change(&project.id, &project, false).unwrap().is_some());

        let backup = manager.crash_files().read_backup().unwrap().unwrap();
        assert_eq!(backup.project_data.input_f64("groundSnowLoad"), Some(45.0));
        assert_eq!(manager.store().checkpoint_count(&project.id).unwrap(), 3);
    }

    #[test]
    fn test_mark_inactive_resets_change_tracking() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);
        assert!(manager.track_data_change(&project.id, &project, false).unwrap().is_some());

        manager.mark_inactive(&project.id);
        assert!(!manager.is_active(&project.id));
        assert!(manager.track_data_change(&project.id, &project, false).unwrap().is_some());
    }

    #[test]
    fn test_autosave_pass_checkpoints_due_projects() {
        let (_dir, manager) = setup(immediate_autosave());
        let first = saved_project(&manager, 35.0);
        let second = saved_project(&manager, 40.0);
        let inactive = saved_project(&manager, 50.0);
        manager.mark_active(&first.id);
        manager.mark_active(&second.id);

        let summary = manager.run_autosave_pass();
        assert_eq!(summary.checkpointed.len(), 2);
        assert!(summary.failed.is_empty());
        assert_eq!(manager.store().checkpoint_count(&inactive.id).unwrap(), 0);
        assert!(manager.crash_files().read_backup().unwrap().is_some());

        let listed = manager.store().list_checkpoints(&first.id, 10).unwrap();
        assert_eq!(listed[0].operation, CheckpointOperation::AutoSave);
    }

    #[test]
    fn test_autosave_pass_skips_fresh_projects() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);

        let summary = manager.run_autosave_pass();
        assert!(summary.checkpointed.is_empty());
        assert_eq!(summary.not_due, 1);
    }

    #[test]
    fn test_autosave_failure_does_not_block_others() {
        let (_dir, manager) = setup(immediate_autosave());
        let good = saved_project(&manager, 35.0);
        manager.mark_active("never-saved");
        manager.mark_active(&good.id);

        let summary = manager.run_autosave_pass();
        assert_eq!(summary.checkpointed, vec![good.id.clone()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "never-saved");
    }

    #[test]
    fn test_autosave_pass_after_shutdown_writes_nothing() {
        let (_dir, manager) = setup(immediate_autosave());
        manager.initialize().unwrap();
        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);
        manager.shutdown().unwrap();
        let flushed = manager.store().checkpoint_count(&project.id).unwrap();

        let summary = manager.run_autosave_pass();
        assert!(summary.checkpointed.is_empty());
        assert_eq!(manager.store().checkpoint_count(&project.id).unwrap(), flushed);
        assert!(!manager.crash_files().backup_path().exists());
    }

    #[test]
    fn test_shutdown_waits_for_running_autosave_pass() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        manager.initialize().unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let busy = manager.clone();
        let pass = std::thread::spawn(move || {
            let _pass = busy.autosave_pass.lock().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(150));
        });
        held_rx.recv().unwrap();

        let started = Instant::now();
        manager.shutdown().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        pass.join().unwrap();
    }

    #[test]
    fn test_panic_hook_takes_emergency_checkpoint() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);

        let handlers = manager.install_emergency_handlers();
        assert!(!handlers.watches_interrupt());
        let caught = std::panic::catch_unwind(|| panic!("calculator fault"));
        assert!(caught.is_err());

        let listed = manager.store().list_checkpoints(&project.id, 10).unwrap();
        assert!(listed
            .iter()
            .any(|checkpoint| checkpoint.operation == CheckpointOperation::Emergency));
    }

    #[test]
    fn test_emergency_checkpoint_survives_one_failure() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let good = saved_project(&manager, 35.0);
        manager.mark_active(&good.id);
        manager.mark_active("never-saved");

        let summary = manager.emergency_checkpoint_all();
        assert_eq!(summary.checkpointed, vec![good.id.clone()]);
        assert_eq!(summary.failed.len(), 1);
        assert!(!summary.already_running);

        let listed = manager.store().list_checkpoints(&good.id, 10).unwrap();
        assert_eq!(listed[0].operation, CheckpointOperation::Emergency);

        // Repeated calls keep working.
        assert_eq!(manager.emergency_checkpoint_all().checkpointed.len(), 1);
    }

    #[test]
    fn test_emergency_latch_collapses_overlapping_calls() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        manager.flush_in_progress.store(true, Ordering::SeqCst);
        let summary = manager.emergency_checkpoint_all();
        assert!(summary.already_running);
        assert!(summary.checkpointed.is_empty());
    }

    #[test]
    fn test_recovery_options_order() {
        let (_dir, manager) = setup(CheckpointConfig {
            recovery_option_limit: 2,
            ..CheckpointConfig::default()
        });
        let mut project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);
        manager.track_data_change(&project.id, &project, false).unwrap();
        for snow in [40.0, 45.0] {
            project.inputs = json!({"groundSnowLoad": snow});
            project.touch();
            project = manager.store().save(&project).unwrap();
            manager.track_data_change(&project.id, &project, false).unwrap();
        }

        let options = manager.get_recovery_options(&project.id).unwrap();
        assert_eq!(options.len(), 4);
        assert_eq!(options[0].source, RecoverySource::StateBackup);
        assert!(matches!(options[1].source, RecoverySource::Checkpoint { .. }));
        assert_eq!(options[1].project.input_f64("groundSnowLoad"), Some(45.0));
        assert_eq!(options[2].project.input_f64("groundSnowLoad"), Some(40.0));
        assert_eq!(options[3].source, RecoverySource::LastGoodState);
    }

    #[test]
    fn test_restore_missing_checkpoint_is_none() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        assert!(manager.restore_from_checkpoint("missing").is_none());
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown_lifecycle() {
        let (_dir, manager) = setup(CheckpointConfig::default());
        let report = manager.initialize().unwrap();
        assert!(report.previous_crash.is_none());
        assert!(report.autosave_started);
        assert!(manager.crash_files().marker_exists());

        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);
        manager.track_data_change(&project.id, &project, false).unwrap();
        assert!(manager.crash_files().read_backup().unwrap().is_some());

        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        assert!(!manager.crash_files().marker_exists());
        assert!(manager.crash_files().read_backup().unwrap().is_none());
        assert!(InstanceLock::holder(&manager.crash_files().lock_path()).is_none());

        let listed = manager.store().list_checkpoints(&project.id, 10).unwrap();
        assert_eq!(listed[0].operation, CheckpointOperation::Emergency);
    }

    #[tokio::test]
    async fn test_unclean_exit_is_reported_on_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("stratify.db");
        let project_id = {
            let store = PersistentStore::open(&db, StoreConfig::default()).unwrap();
            let manager =
                Arc::new(CheckpointManager::new(store, dir.path(), CheckpointConfig::default()));
            manager.initialize().unwrap();
            let project = saved_project(&manager, 45.0);
            manager.mark_active(&project.id);
            manager.track_data_change(&project.id, &project, false).unwrap();
            project.id
            // dropped without shutdown
        };

        let store = PersistentStore::open(&db, StoreConfig::default()).unwrap();
        let manager =
            Arc::new(CheckpointManager::new(store, dir.path(), CheckpointConfig::default()));
        let report = manager.initialize().unwrap();
        let crash = report.previous_crash.unwrap();
        assert_eq!(crash.backup.project_data.id, project_id);
        assert_eq!(crash.backup.project_data.input_f64("groundSnowLoad"), Some(45.0));
        manager.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_second_manager_on_same_directory_is_refused() {
        let (dir, manager) = setup(CheckpointConfig::default());
        manager.initialize().unwrap();

        let store =
            PersistentStore::open(&dir.path().join("stratify.db"), StoreConfig::default()).unwrap();
        let other =
            Arc::new(CheckpointManager::new(store, dir.path(), CheckpointConfig::default()));
        assert_eq!(other.initialize().unwrap_err().error_code(), "FILE_LOCKED");
        manager.shutdown().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_worker_autosaves() {
        let (_dir, manager) = setup(CheckpointConfig {
            autosave_interval_secs: 0,
            worker_tick_ms: 20,
            ..CheckpointConfig::default()
        });
        let project = saved_project(&manager, 35.0);
        manager.mark_active(&project.id);
        let mut events = manager.subscribe();
        manager.initialize().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.project_id, project.id);
        assert_eq!(event.operation, CheckpointOperation::AutoSave);
        manager.shutdown().unwrap();
    }
}
