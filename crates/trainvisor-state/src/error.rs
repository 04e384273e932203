//! Error types for trainvisor-state

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem error
    #[error("I/O failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization failed for {path}: {reason}")]
    Deserialization { path: String, reason: String },

    /// Run not found in the store
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Checkpoint not found in the store
    #[error("Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    /// Checkpoint request rejected before anything was written
    #[error("Invalid checkpoint {checkpoint_id}: {reason}")]
    InvalidCheckpoint {
        checkpoint_id: String,
        reason: String,
    },

    /// Stored payload does not hash to the recorded digest
    #[error("Checkpoint {checkpoint_id} payload digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        checkpoint_id: String,
        expected: String,
        actual: String,
    },

    /// Write rejected by the backend (used by fakes for failure injection)
    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether this error is a "not found" outcome rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RunNotFound { .. } | StorageError::CheckpointNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Rejected lifecycle phase change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid phase transition for run {run_id}: {from} -> {to}")]
pub struct TransitionError {
    pub run_id: String,
    pub from: String,
    pub to: String,
}
