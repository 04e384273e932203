//! Trainvisor Core Library
//!
//! Run registry, log parsing, status fan-out and the ambient configuration
//! and telemetry shared by the supervisor and the CLI.

pub mod analytics;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod log_parser;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod telemetry;

pub use analytics::{eta, summarize, Eta, MetricsSummary};
pub use broadcaster::{Broadcaster, Heartbeat, StatusEvent, Subscription};
pub use config::{validate_training, OrchestratorConfig, WorkerSpec};
pub use error::{ConfigError, RegistryError, Result};
pub use log_parser::{apply as apply_extracted, Extracted, LogParser, ParseRule, ParsedUpdate};
pub use registry::{JobRegistry, RegistryOptions, RunPatch, RESTART_MESSAGE};

pub use trainvisor_state::{
    CheckpointInfo, CheckpointRecord, CheckpointStore, CheckpointTag, Job, LiveMetrics, LogLine,
    LogStream, MetricGoal, MetricSample, Phase, RunDocument, RunId, SaveCheckpoint, StateDocument,
    StateStore, TrainingConfig,
};

pub use metrics::METRICS;
pub use obs::{
    emit_cancel_requested, emit_checkpoint_saved, emit_persist_failed, emit_phase_changed,
    emit_run_created, emit_run_recovered, emit_spawn_failed, emit_worker_exited,
    emit_worker_spawned, run_span, RunSpan,
};
pub use telemetry::init_tracing;

/// Trainvisor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
