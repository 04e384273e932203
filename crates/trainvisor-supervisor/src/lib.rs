//! Trainvisor Supervisor - worker process supervision
//!
//! Provides the process supervisor that:
//! - Spawns training workers with an isolated environment
//! - Streams their output into the run registry and log parser
//! - Records the final phase when a worker exits or is cancelled
//! - Links checkpoints to runs and starts runs from checkpoints

pub mod command;
mod error;
pub mod lines;
mod runner;
mod supervisor;

// Re-export key types
pub use command::{WorkerCommand, RESUME_TOKEN_ENV, RUN_ID_ENV};
pub use error::{Result, SupervisorError};
pub use lines::LineSplitter;
pub use runner::STDERR_PREFIX;
pub use supervisor::Supervisor;
