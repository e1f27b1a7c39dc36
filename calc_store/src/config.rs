//! # Configuration
//!
//! Tunables for the store, the checkpoint manager and the resilience
//! wrapper. Every field has a default, so a config file only needs the
//! values it wants to change:
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/stratify",
//!   "checkpoints": { "autosave_interval_secs": 120 },
//!   "resilience": { "default_timeout_ms": 10000 }
//! }
//! ```
//!
//! ## Example
//!
//! ```rust
//! use calc_store::config::PersistenceConfig;
//!
//! let config = PersistenceConfig::in_dir("/tmp/stratify-demo");
//! assert!(config.db_path().ends_with("stratify.db"));
//! assert_eq!(config.checkpoints.max_checkpoints_per_project, 50);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};
use crate::retry::RetryPolicy;

/// File name of the SQLite database inside the data directory
pub const DB_FILE_NAME: &str = "stratify.db";

/// Root configuration handed to [`PersistenceContext`](crate::context::PersistenceContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the database and the crash-recovery files
    pub data_dir: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl PersistenceConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        PersistenceConfig {
            data_dir: data_dir.into(),
            store: StoreConfig::default(),
            checkpoints: CheckpointConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: &Path) -> StoreResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            StoreError::file_error("read config", path.display().to_string(), e.to_string())
        })?;
        serde_json::from_str(&contents).map_err(|e| StoreError::SerializationError {
            reason: format!("Invalid config in {}: {}", path.display(), e),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn state_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Settings for [`PersistentStore`](crate::store::PersistentStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long SQLite waits on a lock before reporting `BUSY`
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Retry policy for transient storage failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_busy_timeout_ms() -> u64 {
    1_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Settings for [`CheckpointManager`](crate::checkpoint::CheckpointManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Minimum age of the last checkpoint before auto-save takes another
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,

    /// Period of the background auto-save worker
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,

    /// Checkpoints kept per project; older ones are pruned
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints_per_project: usize,

    /// How many checkpoints `get_recovery_options` lists
    #[serde(default = "default_recovery_option_limit")]
    pub recovery_option_limit: usize,

    /// Capacity of the checkpoint event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_autosave_interval_secs() -> u64 {
    300
}

fn default_worker_tick_ms() -> u64 {
    30_000
}

fn default_max_checkpoints() -> usize {
    50
}

fn default_recovery_option_limit() -> usize {
    5
}

fn default_event_capacity() -> usize {
    64
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            autosave_interval_secs: default_autosave_interval_secs(),
            worker_tick_ms: default_worker_tick_ms(),
            max_checkpoints_per_project: default_max_checkpoints(),
            recovery_option_limit: default_recovery_option_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl CheckpointConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.max(10))
    }
}

/// Defaults applied by [`ResilienceWrapper`](crate::resilience::ResilienceWrapper).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Per-attempt deadline
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Lifetime of idempotency records
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Backoff shape between attempts (`max_attempts` is ignored here)
    #[serde(default = "default_backoff")]
    pub backoff: RetryPolicy,
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_idempotency_ttl_secs() -> u64 {
    3_600
}

fn default_backoff() -> RetryPolicy {
    RetryPolicy::default().with_delays(100, 5_000, 50)
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            default_retries: default_retries(),
            default_timeout_ms: default_timeout_ms(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            backoff: default_backoff(),
        }
    }
}

impl ResilienceConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{
            "data_dir": "/tmp/stratify",
            "checkpoints": { "autosave_interval_secs": 60 }
        }"#;
        let config: PersistenceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.checkpoints.autosave_interval(), Duration::from_secs(60));
        assert_eq!(config.checkpoints.max_checkpoints_per_project, 50);
        assert_eq!(config.resilience.default_retries, 3);
        assert_eq!(config.resilience.idempotency_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.store.busy_timeout_ms, 1_000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/stratify").join(DB_FILE_NAME));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistence.json");
        fs::write(
            &path,
            r#"{"data_dir": "data", "resilience": {"default_timeout_ms": 500}}"#,
        )
        .unwrap();
        let config = PersistenceConfig::from_json_file(&path).unwrap();
        assert_eq!(config.resilience.default_timeout(), Duration::from_millis(500));

        let err = PersistenceConfig::from_json_file(&dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.error_code(), "FILE_ERROR");
    }

    #[test]
    fn test_worker_tick_has_floor() {
        let config = CheckpointConfig {
            worker_tick_ms: 0,
            ..CheckpointConfig::default()
        };
        assert_eq!(config.worker_tick(), Duration::from_millis(10));
    }
}
