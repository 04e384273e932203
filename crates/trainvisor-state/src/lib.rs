//! Trainvisor-State: persistence layer for the training job orchestrator
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable run records and verified checkpoint payloads.
//!
//! ## Key Components
//!
//! - `Job` / `Phase`: the run record and its lifecycle state machine
//! - `StateStore`: per-run document persistence (`FsStateStore`, `MemoryStateStore`)
//! - `CheckpointStore`: checkpoint payloads with `latest`/`best` aliases
//!   (`FsCheckpointStore`, `MemoryCheckpointStore`)

mod error;
pub mod fakes;
mod fs_checkpoints;
mod fs_state;
mod fs_util;
mod schema;
pub mod storage_traits;

pub use error::{StorageError, TransitionError};
pub use fs_checkpoints::FsCheckpointStore;
pub use fs_state::FsStateStore;
pub use schema::{
    is_path_safe, CheckpointInfo, CheckpointRecord, CheckpointTag, Job, LiveMetrics, LogLine,
    LogStream, MetricGoal, MetricSample, Phase, RunDocument, RunId, StateDocument, TrainingConfig,
};
pub use storage_traits::{
    plan_tags, CheckpointStore, SaveCheckpoint, StateStore, StorageResult, TagPlan,
};
