//! Global atomic counters for Trainvisor observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    lines_parsed: AtomicU64,
    checkpoints_saved: AtomicU64,
    persist_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            lines_parsed: AtomicU64::new(0),
            checkpoints_saved: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_finished", "counter incremented");
    }

    /// Count a worker output line that matched a parser rule.
    pub fn inc_lines_parsed(&self) {
        self.lines_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checkpoints_saved(&self) {
        self.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "checkpoints_saved", "counter incremented");
    }

    pub fn inc_persist_failures(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persist_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_finished = self.runs_finished(),
            lines_parsed = self.lines_parsed(),
            checkpoints_saved = self.checkpoints_saved(),
            persist_failures = self.persist_failures(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_finished(&self) -> u64 {
        self.runs_finished.load(Ordering::Relaxed)
    }

    pub fn lines_parsed(&self) -> u64 {
        self.lines_parsed.load(Ordering::Relaxed)
    }

    pub fn checkpoints_saved(&self) -> u64 {
        self.checkpoints_saved.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_finished.store(0, Ordering::Relaxed);
        self.lines_parsed.store(0, Ordering::Relaxed);
        self.checkpoints_saved.store(0, Ordering::Relaxed);
        self.persist_failures.store(0, Ordering::Relaxed);
    }
}
