//! # Project Service
//!
//! Guarded project operations: each call goes through the
//! [`ResilienceWrapper`], runs its store work on the blocking pool and keeps
//! the [`CheckpointManager`]'s active set and change tracking current.
//!
//! Results are produced by a [`Calculator`] whenever inputs change, so a
//! stored project never carries results computed from other inputs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::checkpoint::CheckpointManager;
use crate::errors::{StoreError, StoreResult};
use crate::project::{CheckpointOperation, ProjectRecord, ProjectSummary};
use crate::resilience::{validate, Operation, OperationError, ResilienceWrapper};
use crate::store::{offload, PersistentStore};

/// Longest accepted project name
pub const MAX_NAME_LEN: usize = 200;

/// Engineering calculation run on every input change.
pub trait Calculator: Send + Sync {
    fn compute(&self, geometry: &Value, inputs: &Value) -> StoreResult<Value>;
}

/// Fields supplied when creating a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub geometry: Value,
    #[serde(default = "empty_object")]
    pub inputs: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl ProjectDraft {
    pub fn new(name: impl Into<String>) -> Self {
        ProjectDraft {
            name: name.into(),
            description: String::new(),
            geometry: empty_object(),
            inputs: empty_object(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_geometry(mut self, geometry: Value) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }
}

/// A loaded project and, if the stored copy was corrupt, the checkpoint it
/// was rebuilt from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedProject {
    pub project: ProjectRecord,
    pub recovered_from: Option<String>,
}

#[derive(Clone)]
pub struct ProjectService {
    store: PersistentStore,
    checkpoints: Arc<CheckpointManager>,
    wrapper: ResilienceWrapper,
    calculator: Arc<dyn Calculator>,
}

impl ProjectService {
    pub fn new(
        store: PersistentStore,
        checkpoints: Arc<CheckpointManager>,
        wrapper: ResilienceWrapper,
        calculator: Arc<dyn Calculator>,
    ) -> Self {
        ProjectService {
            store,
            checkpoints,
            wrapper,
            calculator,
        }
    }

    /// Validate, compute, save and start tracking a new project.
    ///
    /// Idempotent on the draft: repeating the same draft within the
    /// idempotency window returns the project created the first time, as
    /// long as that project is still stored. Otherwise it is created again.
    pub async fn create_project(
        &self,
        draft: ProjectDraft,
    ) -> Result<ProjectRecord, OperationError> {
        let stored = self.store.clone();
        let op = Operation::new("create_project")
            .arg("name", json!(draft.name))
            .arg("description", json!(draft.description))
            .arg("geometry", draft.geometry.clone())
            .arg("inputs", draft.inputs.clone())
            .validate("name", validate::non_empty_string())
            .validate("name", validate::max_len(MAX_NAME_LEN))
            .validate("geometry", validate::is_object())
            .validate("inputs", validate::non_negative_fields())
            .idempotent()
            .reuse_cached_if(Arc::new(move |cached: &Value| -> StoreResult<bool> {
                match cached.get("id").and_then(Value::as_str) {
                    Some(id) => stored.exists(id),
                    None => Ok(false),
                }
            }));

        // One id for every attempt, so a retried save upserts the same row.
        let record = ProjectRecord::new(draft.name.trim(), draft.description)
            .with_geometry(draft.geometry)
            .with_inputs(draft.inputs);

        let project = self
            .wrapper
            .run(op, |_| {
                let mut record = record.clone();
                let store = self.store.clone();
                let checkpoints = self.checkpoints.clone();
                let calculator = self.calculator.clone();
                offload("create project", move || {
                    record.results = calculator.compute(&record.geometry, &record.inputs)?;
                    let saved = store.save(&record)?;
                    checkpoints.mark_active(&saved.id);
                    track_best_effort(&checkpoints, &saved);
                    tracing::info!(project_id = %saved.id, name = %saved.name, "project created");
                    Ok(saved)
                })
            })
            .await?;
        // A cached result skipped the body above.
        self.checkpoints.mark_active(&project.id);
        Ok(project)
    }

    /// Replace a project's inputs and recompute its results.
    ///
    /// A `pre_operation` checkpoint is taken first; on failure its id is in
    /// [`OperationError::rollback_checkpoint`].
    pub async fn update_inputs(
        &self,
        project_id: &str,
        inputs: Value,
    ) -> Result<ProjectRecord, OperationError> {
        let op = Operation::new("update_inputs")
            .arg("project_id", json!(project_id))
            .arg("inputs", inputs.clone())
            .validate("project_id", validate::non_empty_string())
            .validate("inputs", validate::is_object())
            .validate("inputs", validate::non_negative_fields())
            .checkpoint_before(project_id);

        self.wrapper
            .run(op, |_| {
                let project_id = project_id.to_string();
                let inputs = inputs.clone();
                let store = self.store.clone();
                let checkpoints = self.checkpoints.clone();
                let calculator = self.calculator.clone();
                offload("update inputs", move || {
                    let mut record = store
                        .load(&project_id)?
                        .ok_or_else(|| StoreError::not_found("project", &project_id))?;
                    record.inputs = inputs;
                    record.results = calculator.compute(&record.geometry, &record.inputs)?;
                    record.touch();
                    let saved = store.save(&record)?;
                    checkpoints.mark_active(&saved.id);
                    track_best_effort(&checkpoints, &saved);
                    tracing::info!(
                        project_id = %saved.id,
                        version = saved.version,
                        "project inputs updated"
                    );
                    Ok(saved)
                })
            })
            .await
    }

    /// Explicit user save: a `manual` checkpoint of the stored state.
    pub async fn save_project(&self, project_id: &str) -> Result<String, OperationError> {
        let op = Operation::new("save_project")
            .arg("project_id", json!(project_id))
            .validate("project_id", validate::non_empty_string());

        self.wrapper
            .run(op, |_| {
                let project_id = project_id.to_string();
                let checkpoints = self.checkpoints.clone();
                offload("save project", move || {
                    checkpoints.create_checkpoint(&project_id, CheckpointOperation::Manual, None)
                })
            })
            .await
    }

    /// Load a project and mark it active.
    ///
    /// A corrupt stored copy is replaced by the newest checkpoint that still
    /// verifies. Without one the `DataCorrupted` error is returned.
    pub async fn load_project(&self, project_id: &str) -> Result<LoadedProject, OperationError> {
        let op = Operation::new("load_project")
            .arg("project_id", json!(project_id))
            .validate("project_id", validate::non_empty_string());

        self.wrapper
            .run(op, |_| {
                let project_id = project_id.to_string();
                let store = self.store.clone();
                let checkpoints = self.checkpoints.clone();
                offload("load project", move || {
                    let loaded = match store.load(&project_id) {
                        Ok(Some(project)) => LoadedProject {
                            project,
                            recovered_from: None,
                        },
                        Ok(None) => return Err(StoreError::not_found("project", &project_id)),
                        Err(err @ StoreError::DataCorrupted { .. }) => {
                            recover_from_checkpoint(&store, &checkpoints, &project_id, err)?
                        }
                        Err(err) => return Err(err),
                    };
                    checkpoints.mark_active(&project_id);
                    Ok(loaded)
                })
            })
            .await
    }

    /// Delete a project and its checkpoints. Returns whether it existed;
    /// deleting an absent project succeeds.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool, OperationError> {
        let op = Operation::new("delete_project")
            .arg("project_id", json!(project_id))
            .validate("project_id", validate::non_empty_string());

        self.wrapper
            .run(op, |_| {
                let project_id = project_id.to_string();
                let store = self.store.clone();
                let checkpoints = self.checkpoints.clone();
                offload("delete project", move || {
                    let existed = store.delete(&project_id)?;
                    checkpoints.mark_inactive(&project_id);
                    Ok(existed)
                })
            })
            .await
    }

    /// Stop tracking a project; its data stays stored.
    pub fn close_project(&self, project_id: &str) {
        self.checkpoints.mark_inactive(project_id);
    }

    pub async fn list_projects(&self) -> StoreResult<Vec<ProjectSummary>> {
        let store = self.store.clone();
        offload("list projects", move || store.list_projects()).await
    }
}

/// Change tracking after a successful save. The save already happened, so a
/// checkpoint failure is only logged.
fn track_best_effort(checkpoints: &CheckpointManager, project: &ProjectRecord) {
    if let Err(err) = checkpoints.track_data_change(&project.id, project, false) {
        tracing::warn!(project_id = %project.id, error = %err, "change checkpoint failed");
    }
}

fn recover_from_checkpoint(
    store: &PersistentStore,
    checkpoints: &CheckpointManager,
    project_id: &str,
    corruption: StoreError,
) -> StoreResult<LoadedProject> {
    tracing::warn!(
        project_id,
        error = %corruption,
        "stored project is corrupt, looking for a checkpoint"
    );
    let limit = checkpoints.config().recovery_option_limit;
    let candidates = store.list_checkpoints(project_id, limit)?;
    let Some(checkpoint) = candidates.into_iter().next() else {
        tracing::error!(project_id, "no restorable checkpoint");
        return Err(corruption);
    };

    let restored = store.save(&checkpoint.data)?;
    checkpoints.clear_tracking(project_id);
    tracing::warn!(
        project_id,
        checkpoint_id = %checkpoint.id,
        version = restored.version,
        "project restored from checkpoint"
    );
    Ok(LoadedProject {
        project: restored,
        recovered_from: Some(checkpoint.id),
    })
}

/// Roof snow load from ground snow load, used by tests across the crate.
#[cfg(test)]
pub(crate) struct SnowLoadCalculator;

#[cfg(test)]
impl Calculator for SnowLoadCalculator {
    fn compute(&self, _geometry: &Value, inputs: &Value) -> StoreResult<Value> {
        let ground = inputs
            .get("groundSnowLoad")
            .and_then(Value::as_f64)
            .ok_or_else(|| StoreError::calculation_failed("snow_load", "groundSnowLoad missing"))?;
        // Flat-roof factor 0.7
        Ok(json!({ "roofSnowLoad": ground * 0.7 }))
    }
}
