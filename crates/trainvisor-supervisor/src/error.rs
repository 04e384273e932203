use thiserror::Error;
use trainvisor_core::{ConfigError, RegistryError};
use trainvisor_state::StorageError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run {0} has no live worker")]
    AlreadyFinished(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SupervisorError {
    pub fn is_not_found(&self) -> bool {
        match self {
            SupervisorError::NotFound(_) => true,
            SupervisorError::Registry(e) => e.is_not_found(),
            SupervisorError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
