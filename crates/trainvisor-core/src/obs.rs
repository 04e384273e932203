//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: creation, phase change,
//!   worker spawn/exit, checkpoint save, persistence failure
//!
//! Events are emitted at `info!` level unless noted. Set `RUST_LOG` to
//! filter and pass `--json` to the CLI for JSON output.

use tracing::{info, warn};
use trainvisor_state::Phase;

/// RAII guard that enters a run-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("run_1712345678901_ab12cd34");
/// // every event logged while the guard lives carries run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("trainvisor.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Span for a supervising task; attach with `Instrument::instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("trainvisor.run", run_id = %run_id)
}

pub fn emit_run_created(run_id: &str, label: &str) {
    info!(event = "run.created", run_id = %run_id, label = %label);
}

pub fn emit_phase_changed(run_id: &str, from: Phase, to: Phase) {
    info!(event = "run.phase_changed", run_id = %run_id, from = %from, to = %to);
}

pub fn emit_worker_spawned(run_id: &str, pid: Option<u32>, program: &str) {
    info!(event = "worker.spawned", run_id = %run_id, pid = ?pid, program = %program);
}

/// Emit event: worker exited. `code` is `None` when killed by a signal.
pub fn emit_worker_exited(run_id: &str, code: Option<i32>, duration_ms: u64) {
    info!(
        event = "worker.exited",
        run_id = %run_id,
        code = ?code,
        duration_ms = duration_ms,
    );
}

/// Emit event: worker could not be started (warning level).
pub fn emit_spawn_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "worker.spawn_failed", run_id = %run_id, error = %error);
}

pub fn emit_cancel_requested(run_id: &str) {
    info!(event = "run.cancel_requested", run_id = %run_id);
}

pub fn emit_checkpoint_saved(run_id: &str, checkpoint_id: &str, tag: &str) {
    info!(
        event = "checkpoint.saved",
        run_id = %run_id,
        checkpoint_id = %checkpoint_id,
        tag = %tag,
    );
}

/// Emit event: a state write failed (warning level).
pub fn emit_persist_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "state.persist_failed", run_id = %run_id, error = %error);
}

/// Emit event: a run was found active on startup and marked failed.
pub fn emit_run_recovered(run_id: &str, phase: Phase) {
    warn!(event = "run.recovered", run_id = %run_id, phase = %phase);
}
