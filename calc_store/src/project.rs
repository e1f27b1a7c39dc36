//! # Project Data Structures
//!
//! Records owned by the persistence layer. A [`ProjectRecord`] is the root
//! container for one calculation project; a [`Checkpoint`] is an immutable
//! snapshot of a record taken for later recovery.
//!
//! ## Structure
//!
//! ```text
//! ProjectRecord
//! ├── id, name, description
//! ├── geometry / inputs / results  (JSON objects from the calculators)
//! ├── created_at, updated_at, version
//! └── checksum  (SHA-256 of the canonical body, checksum field excluded)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use calc_store::project::ProjectRecord;
//! use serde_json::json;
//!
//! let mut project = ProjectRecord::new("Warehouse roof", "Snow drift check")
//!     .with_inputs(json!({"groundSnowLoad": 35.0}));
//! project.seal().unwrap();
//! assert!(project.verify_checksum());
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::integrity;

/// One persisted calculation project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Globally unique, assigned at creation, never changes
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Structural geometry consumed by the calculators
    #[serde(default = "empty_object")]
    pub geometry: Value,

    /// Design inputs (e.g. `groundSnowLoad`)
    #[serde(default = "empty_object")]
    pub inputs: Value,

    /// Calculator output for the current geometry and inputs
    #[serde(default = "empty_object")]
    pub results: Value,

    pub created_at: DateTime<Utc>,

    /// Assigned by the store on every save
    pub updated_at: DateTime<Utc>,

    /// Revision counter, bumped by [`ProjectRecord::touch`]
    pub version: u64,

    /// Digest of the record body; empty until sealed
    #[serde(default)]
    pub checksum: String,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ProjectRecord {
    /// Create a new, unsealed project with a fresh UUID.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        ProjectRecord {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            geometry: empty_object(),
            inputs: empty_object(),
            results: empty_object(),
            created_at: now,
            updated_at: now,
            version: 1,
            checksum: String::new(),
        }
    }

    pub fn with_geometry(mut self, geometry: Value) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.results = results;
        self
    }

    /// Bump the revision and the modified timestamp.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Read a numeric input by name.
    pub fn input_f64(&self, name: &str) -> Option<f64> {
        self.inputs.get(name).and_then(Value::as_f64)
    }

    /// Canonical bytes of the record with the checksum field removed.
    pub fn body_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut value = serde_json::to_value(self).map_err(StoreError::serialization)?;
        if let Value::Object(map) = &mut value {
            map.remove("checksum");
        }
        integrity::canonical_bytes(&value)
    }

    /// Digest the body would have right now.
    pub fn compute_checksum(&self) -> StoreResult<String> {
        Ok(integrity::checksum(&self.body_bytes()?))
    }

    /// Recompute and store the checksum, returning the hashed body bytes.
    pub fn seal(&mut self) -> StoreResult<Vec<u8>> {
        let body = self.body_bytes()?;
        self.checksum = integrity::checksum(&body);
        Ok(body)
    }

    /// Whether the stored checksum matches the current body.
    pub fn verify_checksum(&self) -> bool {
        match self.body_bytes() {
            Ok(body) => integrity::verify(&body, &self.checksum),
            Err(_) => false,
        }
    }

    /// Decode a record from stored body bytes, verifying them first.
    ///
    /// Returns `DataCorrupted` on checksum mismatch or a malformed payload.
    pub fn from_verified_body(id: &str, body: &[u8], checksum: &str) -> StoreResult<Self> {
        if !integrity::verify(body, checksum) {
            return Err(StoreError::data_corrupted(id, "checksum mismatch"));
        }
        let mut record: ProjectRecord = serde_json::from_slice(body)
            .map_err(|e| StoreError::data_corrupted(id, format!("malformed record body: {}", e)))?;
        if record.id != id {
            return Err(StoreError::data_corrupted(
                id,
                format!("body belongs to project '{}'", record.id),
            ));
        }
        record.checksum = checksum.to_string();
        Ok(record)
    }

    /// Decode a sealed record (checksum field included) from stored bytes.
    ///
    /// The embedded checksum is checked against the body as it was stored,
    /// before the bytes become a typed record.
    pub fn from_sealed_json(owner: &str, bytes: &[u8]) -> StoreResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::data_corrupted(owner, format!("malformed snapshot: {}", e)))?;
        Self::from_sealed_value(owner, value)
    }

    /// Same as [`ProjectRecord::from_sealed_json`] for an already parsed value.
    pub fn from_sealed_value(owner: &str, mut value: Value) -> StoreResult<Self> {
        let Some(map) = value.as_object_mut() else {
            return Err(StoreError::data_corrupted(owner, "snapshot is not an object"));
        };
        let checksum = match map.remove("checksum") {
            Some(Value::String(checksum)) => checksum,
            _ => return Err(StoreError::data_corrupted(owner, "snapshot is not sealed")),
        };
        let body = integrity::canonical_bytes(&value)?;
        if !integrity::verify(&body, &checksum) {
            return Err(StoreError::data_corrupted(owner, "embedded project checksum mismatch"));
        }
        let mut record: ProjectRecord = serde_json::from_value(value)
            .map_err(|e| StoreError::data_corrupted(owner, format!("malformed snapshot: {}", e)))?;
        record.checksum = checksum;
        Ok(record)
    }
}

/// Listing entry for a stored project, without the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// What caused a checkpoint to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOperation {
    /// Explicit save requested by the user
    Manual,
    /// Periodic timer pass
    AutoSave,
    /// A significant change was detected
    DataChange,
    /// Termination signal or fault handler
    Emergency,
    /// Forced flush requested by the caller
    ForcedFlush,
    /// Snapshot taken before a risky guarded operation
    PreOperation,
}

impl CheckpointOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointOperation::Manual => "manual",
            CheckpointOperation::AutoSave => "auto_save",
            CheckpointOperation::DataChange => "data_change",
            CheckpointOperation::Emergency => "emergency",
            CheckpointOperation::ForcedFlush => "forced_flush",
            CheckpointOperation::PreOperation => "pre_operation",
        }
    }

    /// Human-readable label used in recovery listings.
    pub fn label(self) -> &'static str {
        match self {
            CheckpointOperation::Manual => "Manual save",
            CheckpointOperation::AutoSave => "Auto-save",
            CheckpointOperation::DataChange => "Data change",
            CheckpointOperation::Emergency => "Emergency save",
            CheckpointOperation::ForcedFlush => "Forced flush",
            CheckpointOperation::PreOperation => "Before operation",
        }
    }
}

impl fmt::Display for CheckpointOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointOperation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(CheckpointOperation::Manual),
            "auto_save" => Ok(CheckpointOperation::AutoSave),
            "data_change" => Ok(CheckpointOperation::DataChange),
            "emergency" => Ok(CheckpointOperation::Emergency),
            "forced_flush" => Ok(CheckpointOperation::ForcedFlush),
            "pre_operation" => Ok(CheckpointOperation::PreOperation),
            other => Err(StoreError::serialization(format!(
                "unknown checkpoint operation '{}'",
                other
            ))),
        }
    }
}

/// Immutable snapshot of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub project_id: String,
    pub data: ProjectRecord,
    pub operation: CheckpointOperation,
    pub timestamp: DateTime<Utc>,
    /// Size in bytes of the serialized snapshot
    pub data_size: u64,
}

impl Checkpoint {
    /// Build a checkpoint of `data` with a fresh id.
    ///
    /// The snapshot is sealed so its embedded checksum can be verified on
    /// restore.
    pub fn new(operation: CheckpointOperation, mut data: ProjectRecord) -> StoreResult<Self> {
        if data.checksum.is_empty() || !data.verify_checksum() {
            data.seal()?;
        }
        let data_size = integrity::canonical_bytes(&data)?.len() as u64;
        Ok(Checkpoint {
            id: Uuid::new_v4().to_string(),
            project_id: data.id.clone(),
            data,
            operation,
            timestamp: Utc::now(),
            data_size,
        })
    }
}

/// Completed operation remembered for idempotent re-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    pub expires_at: DateTime<Utc>,
    /// JSON-encoded result of the original execution
    pub result: String,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
