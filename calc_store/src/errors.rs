//! # Error Types
//!
//! Structured error types for calc_store. Every failure the persistence layer
//! can surface falls into one [`ErrorClass`], which decides whether the store
//! or the resilience wrapper may retry it.
//!
//! | Class              | Retried | Typical cause                                |
//! |--------------------|---------|----------------------------------------------|
//! | `Transient`        | yes     | SQLite lock contention, interrupted I/O      |
//! | `Timeout`          | yes     | an attempt exceeded its deadline             |
//! | `DataCorrupted`    | no      | checksum mismatch, malformed stored payload  |
//! | `ValidationFailed` | no      | rejected argument, with field-level detail   |
//! | `NotFound`         | no      | absent record on a path that requires one    |
//! | `Fatal`            | no      | everything else                              |
//!
//! ## Example
//!
//! ```rust
//! use calc_store::errors::{ErrorClass, StoreError, StoreResult};
//!
//! fn validate_name(name: &str) -> StoreResult<()> {
//!     if name.trim().is_empty() {
//!         return Err(StoreError::validation_failed("name", name, "Name must not be empty"));
//!     }
//!     Ok(())
//! }
//!
//! let err = validate_name("  ").unwrap_err();
//! assert_eq!(err.class(), ErrorClass::ValidationFailed);
//! assert!(!err.is_recoverable());
//! ```

use std::fmt;
use std::io;

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for calc_store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification used for retry and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    DataCorrupted,
    ValidationFailed,
    Timeout,
    NotFound,
    Fatal,
}

impl ErrorClass {
    /// Whether failures of this class may be retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::DataCorrupted => "data_corrupted",
            ErrorClass::ValidationFailed => "validation_failed",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error type for persistence operations.
///
/// Each variant carries enough context to diagnose the failure without
/// leading with internal storage paths.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum StoreError {
    /// Lock contention or temporarily unavailable I/O; safe to retry
    #[error("Transient failure during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// Stored data failed integrity verification or could not be decoded
    #[error("Data corrupted for '{id}': {reason}")]
    DataCorrupted { id: String, reason: String },

    /// An argument was rejected before the operation ran
    #[error("Validation failed for '{field}': {value} - {reason}")]
    ValidationFailed {
        field: String,
        value: String,
        reason: String,
    },

    /// An attempt did not finish before its deadline
    #[error("Operation {operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A record required by the operation does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// The external calculator rejected the project inputs
    #[error("Calculation failed: {calculation_type} - {reason}")]
    CalculationFailed {
        calculation_type: String,
        reason: String,
    },

    /// File I/O error outside the transactional store
    #[error("File error: {operation} on '{path}' - {reason}")]
    FileError {
        operation: String,
        path: String,
        reason: String,
    },

    /// The state directory is held by another process
    #[error("State directory locked: '{path}' is locked by {locked_by} since {locked_at}")]
    FileLocked {
        path: String,
        locked_by: String,
        locked_at: String,
    },

    /// Non-transient database failure
    #[error("Database error during {operation}: {reason}")]
    DatabaseError { operation: String, reason: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {reason}")]
    SerializationError { reason: String },

    /// On-disk schema is newer than this build understands
    #[error("Version mismatch: store schema {found_version}, expected {expected_version}")]
    VersionMismatch {
        found_version: i64,
        expected_version: i64,
    },

    /// Generic internal error (should be rare)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Create a Transient error
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a DataCorrupted error
    pub fn data_corrupted(id: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::DataCorrupted {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a ValidationFailed error
    pub fn validation_failed(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StoreError::ValidationFailed {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        StoreError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a NotFound error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a CalculationFailed error
    pub fn calculation_failed(
        calculation_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StoreError::CalculationFailed {
            calculation_type: calculation_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileError
    pub fn file_error(
        operation: impl Into<String>,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StoreError::FileError {
            operation: operation.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileLocked error
    pub fn file_locked(
        path: impl Into<String>,
        locked_by: impl Into<String>,
        locked_at: impl Into<String>,
    ) -> Self {
        StoreError::FileLocked {
            path: path.into(),
            locked_by: locked_by.into(),
            locked_at: locked_at.into(),
        }
    }

    /// Create a SerializationError from any displayable cause
    pub fn serialization(reason: impl fmt::Display) -> Self {
        StoreError::SerializationError {
            reason: reason.to_string(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal {
            message: message.into(),
        }
    }

    /// Map a SQLite error, classifying busy/locked conditions as transient.
    pub fn from_sqlite(operation: impl Into<String>, err: rusqlite::Error) -> Self {
        let operation = operation.into();
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Transient {
                    operation,
                    reason: err.to_string(),
                }
            }
            _ => StoreError::DatabaseError {
                operation,
                reason: err.to_string(),
            },
        }
    }

    /// Map an I/O error on a file outside the store.
    ///
    /// Interrupted or would-block conditions are transient; the rest are not.
    pub fn from_io(operation: impl Into<String>, path: impl Into<String>, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                StoreError::Transient {
                    operation: operation.into(),
                    reason: err.to_string(),
                }
            }
            _ => StoreError::file_error(operation, path, err.to_string()),
        }
    }

    /// Classify this error for retry and recovery decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient { .. } => ErrorClass::Transient,
            StoreError::DataCorrupted { .. } => ErrorClass::DataCorrupted,
            StoreError::ValidationFailed { .. } => ErrorClass::ValidationFailed,
            StoreError::Timeout { .. } => ErrorClass::Timeout,
            StoreError::NotFound { .. } => ErrorClass::NotFound,
            StoreError::CalculationFailed { .. }
            | StoreError::FileError { .. }
            | StoreError::FileLocked { .. }
            | StoreError::DatabaseError { .. }
            | StoreError::SerializationError { .. }
            | StoreError::VersionMismatch { .. }
            | StoreError::Internal { .. } => ErrorClass::Fatal,
        }
    }

    /// Check if this is a recoverable error (e.g., can retry)
    pub fn is_recoverable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Get a short error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Transient { .. } => "TRANSIENT",
            StoreError::DataCorrupted { .. } => "DATA_CORRUPTED",
            StoreError::ValidationFailed { .. } => "VALIDATION_FAILED",
            StoreError::Timeout { .. } => "TIMEOUT",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::CalculationFailed { .. } => "CALCULATION_FAILED",
            StoreError::FileError { .. } => "FILE_ERROR",
            StoreError::FileLocked { .. } => "FILE_LOCKED",
            StoreError::DatabaseError { .. } => "DATABASE_ERROR",
            StoreError::SerializationError { .. } => "SERIALIZATION_ERROR",
            StoreError::VersionMismatch { .. } => "VERSION_MISMATCH",
            StoreError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let error = StoreError::data_corrupted("p-1", "checksum mismatch");
        let json = serde_json::to_string(&error).unwrap();
        let roundtrip: StoreError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, roundtrip);
        assert!(json.contains("\"type\":\"DataCorrupted\""));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(StoreError::not_found("project", "x").error_code(), "NOT_FOUND");
        assert_eq!(StoreError::timeout("save", 50).error_code(), "TIMEOUT");
    }

    #[test]
    fn test_only_transient_and_timeout_are_recoverable() {
        assert!(StoreError::transient("save", "database is locked").is_recoverable());
        assert!(StoreError::timeout("save", 10).is_recoverable());
        assert!(!StoreError::data_corrupted("p", "bad").is_recoverable());
        assert!(!StoreError::validation_failed("name", "", "empty").is_recoverable());
        assert!(!StoreError::internal("boom").is_recoverable());
        assert_eq!(StoreError::serialization("eof").class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_sqlite_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert_eq!(StoreError::from_sqlite("save", busy).class(), ErrorClass::Transient);

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert_eq!(
            StoreError::from_sqlite("save", constraint).error_code(),
            "DATABASE_ERROR"
        );
    }

    #[test]
    fn test_io_interrupted_is_transient() {
        let err = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(StoreError::from_io("write", "/tmp/x", &err).is_recoverable());
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(StoreError::from_io("write", "/tmp/x", &err).error_code(), "FILE_ERROR");
    }
}
