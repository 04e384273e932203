//! Error taxonomy for trainvisor-core.

use std::path::PathBuf;

use trainvisor_state::{StorageError, TransitionError};

/// Errors produced by [`crate::JobRegistry`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::RunNotFound(_))
    }
}

/// Bad or missing configuration, detected before any worker is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("{field} does not exist: {}", path.display())]
    MissingPath { field: String, path: PathBuf },

    #[error("environment variable {var} is not valid: {reason}")]
    Env { var: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_display() {
        let err = RegistryError::RunNotFound("run_1".to_string());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "run not found: run_1");

        let err: RegistryError = TransitionError {
            run_id: "run_1".to_string(),
            from: "completed".to_string(),
            to: "training".to_string(),
        }
        .into();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("completed -> training"));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::MissingPath {
            field: "dataset".to_string(),
            path: PathBuf::from("/nope/data.jsonl"),
        };
        assert_eq!(err.to_string(), "dataset does not exist: /nope/data.jsonl");
    }
}
