//! # Resilience Wrapper
//!
//! Guards an async operation with, in this order:
//!
//! 1. **Validation** of named arguments (no retry, nothing cached on failure)
//! 2. **Idempotency**: a completed, unexpired key returns the cached result
//! 3. **Checkpoint-before-risk**: an optional `pre_operation` snapshot
//! 4. **Attempt loop**: per-attempt timeout, recovery hooks, backoff retry of
//!    `Transient` and `Timeout` failures
//! 5. **Completion record** for the idempotency key
//!
//! ## Example
//!
//! ```rust,no_run
//! use calc_store::config::ResilienceConfig;
//! use calc_store::resilience::{validate, Operation, ResilienceWrapper};
//! use calc_store::store::PersistentStore;
//! use serde_json::json;
//!
//! # async fn demo(store: PersistentStore) {
//! let wrapper = ResilienceWrapper::new(store, ResilienceConfig::default());
//! let op = Operation::new("rename_project")
//!     .arg("name", json!("Warehouse B"))
//!     .validate("name", validate::non_empty_string())
//!     .retries(2)
//!     .idempotent();
//!
//! let renamed: Result<String, _> = wrapper
//!     .run(op, |_attempt| async { Ok("Warehouse B".to_string()) })
//!     .await;
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::checkpoint::CheckpointManager;
use crate::config::ResilienceConfig;
use crate::errors::{ErrorClass, StoreError, StoreResult};
use crate::integrity;
use crate::project::CheckpointOperation;
use crate::store::{offload, PersistentStore};

/// Argument check: `Err(reason)` rejects the value.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Best-effort hook run when an attempt fails with a matching error class.
pub type RecoveryHandler = Arc<dyn Fn(&StoreError) -> StoreResult<()> + Send + Sync>;

/// Whether a cached result still holds; runs on the blocking pool.
pub type CacheCheck = Arc<dyn Fn(&Value) -> StoreResult<bool> + Send + Sync>;

/// Ready-made validators.
pub mod validate {
    use super::Validator;
    use serde_json::Value;
    use std::sync::Arc;

    pub fn non_empty_string() -> Validator {
        Arc::new(|value: &Value| match value.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err("must not be empty".to_string()),
            None => Err("must be a string".to_string()),
        })
    }

    pub fn max_len(max: usize) -> Validator {
        Arc::new(move |value: &Value| match value.as_str() {
            Some(s) if s.chars().count() <= max => Ok(()),
            Some(_) => Err(format!("must be at most {} characters", max)),
            None => Err("must be a string".to_string()),
        })
    }

    pub fn finite_number() -> Validator {
        Arc::new(|value: &Value| match value.as_f64() {
            Some(n) if n.is_finite() => Ok(()),
            _ => Err("must be a finite number".to_string()),
        })
    }

    pub fn positive_number() -> Validator {
        Arc::new(|value: &Value| match value.as_f64() {
            Some(n) if n.is_finite() && n > 0.0 => Ok(()),
            _ => Err("must be a positive number".to_string()),
        })
    }

    pub fn is_object() -> Validator {
        Arc::new(|value: &Value| {
            if value.is_object() {
                Ok(())
            } else {
                Err("must be an object".to_string())
            }
        })
    }

    /// Every number inside an object must be finite and not negative.
    pub fn non_negative_fields() -> Validator {
        Arc::new(|value: &Value| {
            let Some(map) = value.as_object() else {
                return Err("must be an object".to_string());
            };
            for (field, v) in map {
                if let Some(n) = v.as_f64() {
                    if !n.is_finite() || n < 0.0 {
                        return Err(format!("'{}' must be a non-negative number", field));
                    }
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Idempotency {
    Off,
    Derived,
    Explicit(String),
}

/// Description of one guarded call; built fluently and handed to
/// [`ResilienceWrapper::run`].
pub struct Operation {
    name: String,
    args: BTreeMap<String, Value>,
    validators: Vec<(String, Validator)>,
    retries: Option<u32>,
    timeout: Option<Duration>,
    idempotency: Idempotency,
    checkpoint_before: Option<String>,
    recovery: Vec<(ErrorClass, String, RecoveryHandler)>,
    cache_check: Option<CacheCheck>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("validators", &self.validators.len())
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("idempotency", &self.idempotency)
            .field("checkpoint_before", &self.checkpoint_before)
            .field(
                "recovery",
                &self.recovery.iter().map(|(_, name, _)| name).collect::<Vec<_>>(),
            )
            .field("cache_check", &self.cache_check.is_some())
            .finish()
    }
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Operation {
            name: name.into(),
            args: BTreeMap::new(),
            validators: Vec::new(),
            retries: None,
            timeout: None,
            idempotency: Idempotency::Off,
            checkpoint_before: None,
            recovery: Vec::new(),
            cache_check: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Named argument; used by validators and the derived idempotency key.
    pub fn arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    /// Check argument `arg` before anything runs. A missing argument is
    /// validated as `null`.
    pub fn validate(mut self, arg: impl Into<String>, validator: Validator) -> Self {
        self.validators.push((arg.into(), validator));
        self
    }

    /// Retries after the first attempt.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Deadline for each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cache the result under a key derived from the name and arguments.
    pub fn idempotent(mut self) -> Self {
        self.idempotency = Idempotency::Derived;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency = Idempotency::Explicit(key.into());
        self
    }

    /// Snapshot `project_id` before the first attempt.
    pub fn checkpoint_before(mut self, project_id: impl Into<String>) -> Self {
        self.checkpoint_before = Some(project_id.into());
        self
    }

    /// Run `handler` whenever an attempt fails with an error of `class`.
    pub fn recover_with(
        mut self,
        class: ErrorClass,
        name: impl Into<String>,
        handler: RecoveryHandler,
    ) -> Self {
        self.recovery.push((class, name.into(), handler));
        self
    }

    /// Reuse a cached result only while `check` accepts it. A rejected
    /// result is run again and the new result replaces it.
    pub fn reuse_cached_if(mut self, check: CacheCheck) -> Self {
        self.cache_check = Some(check);
        self
    }

    /// The key this operation is cached under, if idempotency is on.
    pub fn resolved_key(&self) -> StoreResult<Option<String>> {
        match &self.idempotency {
            Idempotency::Off => Ok(None),
            Idempotency::Explicit(key) => Ok(Some(key.clone())),
            Idempotency::Derived => {
                let digest = integrity::checksum_of(
                    &json!({ "operation": self.name, "args": self.args }),
                )?;
                Ok(Some(format!("{}:{}", self.name, digest)))
            }
        }
    }

    fn check_arguments(&self) -> StoreResult<()> {
        for (arg, validator) in &self.validators {
            let value = self.args.get(arg).unwrap_or(&Value::Null);
            if let Err(reason) = validator(value) {
                return Err(StoreError::validation_failed(arg, value.to_string(), reason));
            }
        }
        Ok(())
    }
}

/// Terminal failure of a guarded operation.
#[derive(Debug, Error)]
#[error("operation '{operation}' failed after {attempts} attempt(s) in {elapsed:?}: {cause}")]
pub struct OperationError {
    pub operation: String,
    /// Attempts made; 0 when validation or setup failed first
    pub attempts: u32,
    pub elapsed: Duration,
    /// `pre_operation` checkpoint taken before the first attempt
    pub rollback_checkpoint: Option<String>,
    #[source]
    pub cause: StoreError,
}

impl OperationError {
    pub fn class(&self) -> ErrorClass {
        self.cause.class()
    }

    pub fn error_code(&self) -> &'static str {
        self.cause.error_code()
    }

    pub fn into_cause(self) -> StoreError {
        self.cause
    }
}

impl From<OperationError> for StoreError {
    fn from(err: OperationError) -> Self {
        err.cause
    }
}

enum CacheLookup {
    Miss,
    Stale,
    Hit(Value),
}

/// Runs [`Operation`]s against a store and, optionally, a checkpoint manager.
#[derive(Clone)]
pub struct ResilienceWrapper {
    store: PersistentStore,
    checkpoints: Option<Arc<CheckpointManager>>,
    config: ResilienceConfig,
}

impl ResilienceWrapper {
    pub fn new(store: PersistentStore, config: ResilienceConfig) -> Self {
        ResilienceWrapper {
            store,
            checkpoints: None,
            config,
        }
    }

    /// Enable `checkpoint_before` snapshots.
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Run `f` under the guards described by `op`.
    ///
    /// `f` receives the 1-based attempt number and is called once per
    /// attempt.
    pub async fn run<T, F, Fut>(&self, op: Operation, mut f: F) -> Result<T, OperationError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let fail = |attempts: u32, rollback_checkpoint: Option<String>, cause: StoreError| {
            OperationError {
                operation: op.name.clone(),
                attempts,
                elapsed: started.elapsed(),
                rollback_checkpoint,
                cause,
            }
        };

        if let Err(err) = op.check_arguments() {
            tracing::info!(operation = %op.name, error = %err, "operation rejected by validation");
            return Err(fail(0, None, err));
        }

        let key = op.resolved_key().map_err(|e| fail(0, None, e))?;
        if let Some(key) = &key {
            if let Some(cached) = self.cached_result::<T>(&op, key).await {
                return Ok(cached);
            }
        }

        let rollback_checkpoint = match &op.checkpoint_before {
            Some(project_id) => Some(
                self.snapshot_before(&op.name, project_id)
                    .await
                    .map_err(|e| fail(0, None, e))?,
            ),
            None => None,
        };

        let attempts = op.retries.unwrap_or(self.config.default_retries).saturating_add(1);
        let timeout = op.timeout.unwrap_or_else(|| self.config.default_timeout());
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(timeout, f(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::timeout(&op.name, timeout.as_millis() as u64)),
            };

            let err = match outcome {
                Ok(value) => {
                    if let Some(key) = key {
                        self.record_completion(&op.name, key, &value).await;
                    }
                    if attempt > 1 {
                        tracing::info!(
                            operation = %op.name,
                            attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            run_recovery(&op, &err);

            if err.is_recoverable() && attempt < attempts {
                let delay = self.config.backoff.delay_for(attempt);
                tracing::warn!(
                    operation = %op.name,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            tracing::error!(
                operation = %op.name,
                attempt,
                error_code = err.error_code(),
                error = %err,
                rollback_checkpoint = rollback_checkpoint.as_deref().unwrap_or(""),
                "operation failed"
            );
            return Err(fail(attempt, rollback_checkpoint, err));
        }
    }

    /// Cached result for `key`; lookup and decode failures count as a miss,
    /// and so does a result the operation's cache check rejects.
    async fn cached_result<T: DeserializeOwned>(&self, op: &Operation, key: &str) -> Option<T> {
        let operation = op.name.as_str();
        let store = self.store.clone();
        let lookup_key = key.to_string();
        let check = op.cache_check.clone();
        let lookup = offload("idempotency lookup", move || {
            let Some(record) = store.completed_result(&lookup_key)? else {
                return Ok(CacheLookup::Miss);
            };
            let value: Value =
                serde_json::from_str(&record.result).map_err(StoreError::serialization)?;
            if let Some(check) = check {
                if !check(&value)? {
                    return Ok(CacheLookup::Stale);
                }
            }
            Ok(CacheLookup::Hit(value))
        });
        match lookup.await {
            Ok(CacheLookup::Hit(value)) => match serde_json::from_value(value) {
                Ok(value) => {
                    tracing::info!(operation, key, "returning cached result");
                    Some(value)
                }
                Err(err) => {
                    tracing::warn!(
                        operation,
                        key,
                        error = %err,
                        "cached result undecodable, running again"
                    );
                    None
                }
            },
            Ok(CacheLookup::Stale) => {
                tracing::info!(operation, key, "cached result no longer holds, running again");
                None
            }
            Ok(CacheLookup::Miss) => None,
            Err(err) => {
                tracing::warn!(
                    operation,
                    key,
                    error = %err,
                    "idempotency lookup failed, running anyway"
                );
                None
            }
        }
    }

    async fn record_completion<T: Serialize>(&self, operation: &str, key: String, value: &T) {
        let result = match serde_json::to_string(value) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(operation, error = %err, "result not serializable, not cached");
                return;
            }
        };
        let store = self.store.clone();
        let ttl = self.config.idempotency_ttl();
        let name = operation.to_string();
        let recorded = offload("idempotency record", move || {
            store.mark_operation_completed(&key, &name, &result, ttl)
        })
        .await;
        if let Err(err) = recorded {
            tracing::warn!(operation, error = %err, "failed to record completed operation");
        }
    }

    async fn snapshot_before(&self, operation: &str, project_id: &str) -> StoreResult<String> {
        let manager = self.checkpoints.clone().ok_or_else(|| {
            StoreError::internal(format!(
                "operation '{}' asked for a checkpoint but no checkpoint manager is attached",
                operation
            ))
        })?;
        let project_id = project_id.to_string();
        let checkpoint_id = offload("pre-operation checkpoint", move || {
            manager.create_checkpoint(&project_id, CheckpointOperation::PreOperation, None)
        })
        .await?;
        tracing::debug!(
            operation,
            checkpoint_id = %checkpoint_id,
            "pre-operation checkpoint taken"
        );
        Ok(checkpoint_id)
    }
}

/// Run the handlers registered for `err`'s class. Their failures and panics
/// are logged and otherwise ignored.
fn run_recovery(op: &Operation, err: &StoreError) {
    let class = err.class();
    for (_, name, handler) in op.recovery.iter().filter(|(c, _, _)| *c == class) {
        match catch_unwind(AssertUnwindSafe(|| handler(err))) {
            Ok(Ok(())) => {
                tracing::debug!(operation = %op.name, strategy = %name, "recovery strategy ran")
            }
            Ok(Err(recovery_err)) => tracing::warn!(
                operation = %op.name,
                strategy = %name,
                error = %recovery_err,
                "recovery strategy failed"
            ),
            Err(_) => tracing::error!(
                operation = %op.name,
                strategy = %name,
                "recovery strategy panicked"
            ),
        }
    }
}
