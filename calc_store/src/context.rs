//! # Persistence Context
//!
//! Owns one data directory's store, checkpoint manager and resilience
//! wrapper, wired together. Open it once at startup, hand
//! [`ProjectService`]s to the rest of the application and call
//! [`PersistenceContext::shutdown`] on the way out.
//!
//! Dropping a context without `shutdown` is treated as a crash: the crash
//! marker and state backup stay on disk and the next `open` reports them.

use std::sync::Arc;

use crate::checkpoint::{
    CheckpointManager, EmergencyHandlers, EmergencySummary, RecoveryOption, StartupReport,
};
use crate::config::PersistenceConfig;
use crate::errors::StoreResult;
use crate::resilience::ResilienceWrapper;
use crate::service::{Calculator, ProjectService};
use crate::store::PersistentStore;

pub struct PersistenceContext {
    config: PersistenceConfig,
    store: PersistentStore,
    checkpoints: Arc<CheckpointManager>,
    wrapper: ResilienceWrapper,
    startup: StartupReport,
}

impl PersistenceContext {
    /// Open the store, run the startup crash check and start auto-save.
    ///
    /// Call from inside a tokio runtime to get the auto-save worker.
    pub fn open(config: PersistenceConfig) -> StoreResult<Self> {
        let store = PersistentStore::open(&config.db_path(), config.store.clone())?;
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            config.state_dir(),
            config.checkpoints.clone(),
        ));
        let startup = checkpoints.initialize()?;
        let wrapper = ResilienceWrapper::new(store.clone(), config.resilience.clone())
            .with_checkpoints(checkpoints.clone());

        tracing::info!(
            data_dir = %config.data_dir.display(),
            previous_crash = startup.previous_crash.is_some(),
            "persistence context opened"
        );
        Ok(PersistenceContext {
            config,
            store,
            checkpoints,
            wrapper,
            startup,
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn wrapper(&self) -> &ResilienceWrapper {
        &self.wrapper
    }

    /// What the startup crash check found.
    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn project_service(&self, calculator: Arc<dyn Calculator>) -> ProjectService {
        ProjectService::new(
            self.store.clone(),
            self.checkpoints.clone(),
            self.wrapper.clone(),
            calculator,
        )
    }

    pub fn recovery_options(&self, project_id: &str) -> StoreResult<Vec<RecoveryOption>> {
        self.checkpoints.get_recovery_options(project_id)
    }

    /// Flush every active project now, e.g. from a termination signal handler.
    pub fn emergency_flush(&self) -> EmergencySummary {
        self.checkpoints.emergency_checkpoint_all()
    }

    /// Opt in to an emergency flush on panic and on Ctrl-C.
    ///
    /// Keep the returned handlers alive for as long as the context is open.
    pub fn install_emergency_handlers(&self) -> EmergencyHandlers {
        self.checkpoints.install_emergency_handlers()
    }

    /// Clean exit. Safe to call more than once.
    pub fn shutdown(&self) -> StoreResult<()> {
        self.checkpoints.shutdown()
    }
}
