//! # calc_store - Resilient Project Persistence
//!
//! `calc_store` keeps Stratify projects safe on disk: every stored project is
//! checksummed, snapshots are taken automatically while a project is open,
//! and an unclean exit is detected on the next start so the user can pick a
//! recovery point.
//!
//! ## Design Philosophy
//!
//! - **Verify on read**: corrupt data is reported as `DataCorrupted`, never
//!   returned silently
//! - **Retry what is transient**: lock contention and timeouts are retried
//!   with backoff, everything else fails fast
//! - **Never auto-restore**: recovery options are offered, the caller chooses
//! - **JSON-First**: records, errors and config are Serialize/Deserialize
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use calc_store::{PersistenceConfig, PersistenceContext, ProjectDraft};
//! use calc_store::errors::StoreResult;
//! use calc_store::service::Calculator;
//! use serde_json::{json, Value};
//!
//! struct RoofSnow;
//!
//! impl Calculator for RoofSnow {
//!     fn compute(&self, _geometry: &Value, inputs: &Value) -> StoreResult<Value> {
//!         let ground = inputs["groundSnowLoad"].as_f64().unwrap_or(0.0);
//!         Ok(json!({ "roofSnowLoad": ground * 0.7 }))
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let context = PersistenceContext::open(PersistenceConfig::in_dir("data"))?;
//! let _handlers = context.install_emergency_handlers();
//! if let Some(crash) = &context.startup_report().previous_crash {
//!     for option in context.recovery_options(&crash.backup.project_data.id)? {
//!         println!("{} at {}", option.description, option.timestamp);
//!     }
//! }
//!
//! let service = context.project_service(Arc::new(RoofSnow));
//! let draft = ProjectDraft::new("Warehouse").with_inputs(json!({"groundSnowLoad": 35.0}));
//! let project = service.create_project(draft).await?;
//! service.update_inputs(&project.id, json!({"groundSnowLoad": 45.0})).await?;
//!
//! context.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`integrity`] - Canonical JSON bytes and SHA-256 checksums
//! - [`store`] - SQLite-backed project, checkpoint, idempotency and settings storage
//! - [`change`] - Structural-hash change detection
//! - [`checkpoint`] - Auto-save, triggered checkpoints, crash lifecycle and recovery options
//! - [`crash`] - Crash marker, state backup and instance lock files
//! - [`resilience`] - Validation, idempotency, timeout and retry guard for async operations
//! - [`service`] - Guarded project operations
//! - [`context`] - Wiring for one data directory
//! - [`retry`] - Backoff policy
//! - [`config`] - Tunables
//! - [`errors`] - Structured error types

pub mod change;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod crash;
pub mod errors;
pub mod integrity;
pub mod project;
pub mod resilience;
pub mod retry;
pub mod service;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use checkpoint::{
    CheckpointEvent, CheckpointManager, EmergencyHandlers, RecoveryOption, RecoverySource,
    StartupReport,
};
pub use config::PersistenceConfig;
pub use context::PersistenceContext;
pub use errors::{ErrorClass, StoreError, StoreResult};
pub use project::{Checkpoint, CheckpointOperation, ProjectRecord};
pub use resilience::{Operation, OperationError, ResilienceWrapper};
pub use service::{Calculator, LoadedProject, ProjectDraft, ProjectService};
pub use store::PersistentStore;
