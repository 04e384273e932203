//! Owned, injectable registry of training runs.
//!
//! The registry is the only writer of [`Job`] records. Every mutation is
//! applied in memory under a short `std::sync::Mutex` critical section, then
//! handed to a per-run writer task that persists the newest document through
//! the configured [`StateStore`]. Writers coalesce: if several snapshots
//! queue up while a write is in flight, only the newest is written next.
//! A failed write is logged and counted; the in-memory state is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, Instrument};
use trainvisor_state::{
    Job, LiveMetrics, LogLine, LogStream, MetricSample, Phase, RunDocument, RunId, StateDocument,
    StateStore, TrainingConfig, TransitionError,
};

use crate::broadcaster::{Broadcaster, StatusEvent};
use crate::config::{DEFAULT_LOG_CAPACITY, DEFAULT_LOG_TAIL};
use crate::error::{RegistryError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Error message given to runs that were active when the process stopped.
pub const RESTART_MESSAGE: &str = "orchestrator restarted while run was active";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Log lines retained per run
    pub log_capacity: usize,
    /// Lines returned by [`JobRegistry::get_logs`] when no limit is given
    pub default_log_tail: usize,
    /// Fail runs left active by a previous process when opening. Readers
    /// sharing a state directory with a live supervisor turn this off.
    pub recover_interrupted: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            default_log_tail: DEFAULT_LOG_TAIL,
            recover_interrupted: true,
        }
    }
}

/// Field-wise update for [`JobRegistry::update_run`]. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub label: Option<String>,
    pub phase: Option<Phase>,
    pub phase_label: Option<String>,
    pub progress: Option<u8>,
    /// Merged field by field; unset fields keep their value
    pub metrics: Option<LiveMetrics>,
    pub best_metric: Option<f64>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl RunPatch {
    pub fn phase(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }
}

fn merge_metrics(into: &mut LiveMetrics, from: LiveMetrics) {
    fn keep<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }
    keep(&mut into.epoch, from.epoch);
    keep(&mut into.total_epochs, from.total_epochs);
    keep(&mut into.step, from.step);
    keep(&mut into.total_steps, from.total_steps);
    keep(&mut into.loss, from.loss);
    keep(&mut into.val_loss, from.val_loss);
    keep(&mut into.accuracy, from.accuracy);
    keep(&mut into.learning_rate, from.learning_rate);
}

// ---------------------------------------------------------------------------
// Persistence queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum WriteOp {
    Save(Box<RunDocument>),
    Delete,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    version: u64,
    op: WriteOp,
}

/// Point in one writer's queue that a waiter needs to see written.
#[derive(Debug, Clone)]
struct WriteBarrier {
    target: u64,
    done: watch::Receiver<u64>,
}

impl WriteBarrier {
    fn is_done(&self) -> bool {
        *self.done.borrow() >= self.target || self.done.has_changed().is_err()
    }

    async fn wait(mut self) {
        // A closed channel means the writer task is gone; nothing to wait for.
        let _ = self.done.wait_for(|v| *v >= self.target).await;
    }
}

/// Single-writer queue for one run id.
struct RunWriter {
    queue: watch::Sender<Option<PendingWrite>>,
    done: watch::Receiver<u64>,
    submitted: u64,
}

impl RunWriter {
    fn spawn(store: Arc<dyn StateStore>, run_id: RunId) -> Self {
        let (queue, rx) = watch::channel(None);
        let (done_tx, done) = watch::channel(0u64);
        let span = obs::run_span(run_id.as_str());
        tokio::spawn(write_loop(store, run_id, rx, done_tx).instrument(span));
        Self {
            queue,
            done,
            submitted: 0,
        }
    }

    fn submit(&mut self, op: WriteOp) {
        self.submitted += 1;
        self.queue.send_replace(Some(PendingWrite {
            version: self.submitted,
            op,
        }));
    }

    fn barrier(&self) -> WriteBarrier {
        WriteBarrier {
            target: self.submitted,
            done: self.done.clone(),
        }
    }
}

/// Writer tasks by run id.
///
/// Writers of terminal or deleted runs move to `retiring`. They still take
/// writes for their run and are dropped, ending the task, once drained.
#[derive(Default)]
struct Writers {
    live: HashMap<String, RunWriter>,
    retiring: HashMap<String, RunWriter>,
}

impl Writers {
    fn drop_drained(&mut self) {
        self.retiring.retain(|_, w| !w.barrier().is_done());
    }
}

async fn write_loop(
    store: Arc<dyn StateStore>,
    run_id: RunId,
    mut queue: watch::Receiver<Option<PendingWrite>>,
    done: watch::Sender<u64>,
) {
    while queue.changed().await.is_ok() {
        let Some(pending) = queue.borrow_and_update().clone() else {
            continue;
        };
        let result = match &pending.op {
            WriteOp::Save(doc) => store.save_run(doc).await,
            WriteOp::Delete => store.delete_run(&run_id).await,
        };
        match result {
            Ok(()) => debug!(run_id = %run_id, version = pending.version, "Persisted run"),
            Err(e) => {
                METRICS.inc_persist_failures();
                obs::emit_persist_failed(run_id.as_str(), &e);
            }
        }
        done.send_replace(pending.version);
    }
    debug!(run_id = %run_id, "Run writer retired");
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RunEntry {
    doc: RunDocument,
    next_seq: u64,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, RunEntry>,
    /// Run ids in creation order
    order: Vec<RunId>,
}

/// Registry of runs, metrics, log tails and checkpoint links.
pub struct JobRegistry {
    inner: Mutex<Inner>,
    writers: Mutex<Writers>,
    store: Arc<dyn StateStore>,
    broadcaster: Broadcaster,
    options: RegistryOptions,
    persist_submitted: AtomicU64,
}

impl JobRegistry {
    /// Empty registry; nothing is loaded from `store`.
    pub fn new(
        store: Arc<dyn StateStore>,
        broadcaster: Broadcaster,
        options: RegistryOptions,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            writers: Mutex::new(Writers::default()),
            store,
            broadcaster,
            options,
            persist_submitted: AtomicU64::new(0),
        }
    }

    /// Load persisted runs from `store`.
    ///
    /// With [`RegistryOptions::recover_interrupted`] set, runs that were
    /// preparing, training, evaluating or paused have lost their worker;
    /// they are moved to `error` and written back.
    pub async fn open(
        store: Arc<dyn StateStore>,
        broadcaster: Broadcaster,
        options: RegistryOptions,
    ) -> Result<Self> {
        let docs = store.load_all().await?;
        let registry = Self::new(store, broadcaster, options);
        let mut recovered = Vec::new();
        {
            let mut inner = lock(&registry.inner);
            for mut doc in docs {
                let phase = doc.run.phase;
                if registry.options.recover_interrupted
                    && !phase.is_terminal()
                    && phase != Phase::Idle
                {
                    doc.run.transition(Phase::Error)?;
                    doc.run.error = Some(RESTART_MESSAGE.to_string());
                    obs::emit_run_recovered(doc.run.id.as_str(), phase);
                    recovered.push(doc.run.id.clone());
                }
                while doc.logs.len() > registry.options.log_capacity {
                    doc.logs.pop_front();
                }
                let next_seq = doc.logs.back().map_or(0, |l| l.seq + 1);
                let id = doc.run.id.clone();
                inner.order.push(id.clone());
                inner
                    .runs
                    .insert(id.to_string(), RunEntry { doc, next_seq });
            }
            for id in &recovered {
                registry.persist_locked(&inner, id);
            }
        }
        info!(
            runs = lock(&registry.inner).order.len(),
            recovered = recovered.len(),
            "Loaded run state"
        );
        Ok(registry)
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Queue the current document of `id` for writing. Caller holds `inner`.
    fn persist_locked(&self, inner: &Inner, id: &RunId) {
        let Some(entry) = inner.runs.get(id.as_str()) else {
            return;
        };
        let terminal = entry.doc.run.is_terminal();
        self.submit(id, WriteOp::Save(Box::new(entry.doc.clone())), terminal);
    }

    /// Hand `op` to the run's writer. With `retire`, the writer is released
    /// once it has drained.
    fn submit(&self, id: &RunId, op: WriteOp, retire: bool) {
        self.persist_submitted.fetch_add(1, Ordering::Relaxed);
        let mut writers = lock(&self.writers);
        let key = id.as_str();
        let mut writer = match writers.live.remove(key) {
            Some(writer) => writer,
            None => match writers.retiring.remove(key) {
                Some(writer) => writer,
                None => RunWriter::spawn(self.store.clone(), id.clone()),
            },
        };
        writer.submit(op);
        writers.drop_drained();
        if retire {
            writers.retiring.insert(id.to_string(), writer);
        } else {
            writers.live.insert(id.to_string(), writer);
        }
    }

    /// Mutate one run under the lock, persist it, and return the closure's
    /// result together with a copy of the job.
    fn with_run<R>(
        &self,
        id: &RunId,
        f: impl FnOnce(&mut RunEntry) -> std::result::Result<R, RegistryError>,
    ) -> Result<(R, Job)> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .runs
            .get_mut(id.as_str())
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
        let out = f(entry)?;
        let job = entry.doc.run.clone();
        self.persist_locked(&inner, id);
        Ok((out, job))
    }

    fn publish_status(&self, job: &Job) {
        self.broadcaster.publish(StatusEvent::Status(job.clone()));
    }

    // -- runs ---------------------------------------------------------------

    /// Register a new run in phase `idle` and persist it.
    pub fn create_run(&self, label: impl Into<String>, config: TrainingConfig) -> Job {
        let job = Job::new(RunId::new(), label, config);
        {
            let mut inner = lock(&self.inner);
            inner.order.push(job.id.clone());
            inner.runs.insert(
                job.id.to_string(),
                RunEntry {
                    doc: RunDocument::new(job.clone()),
                    next_seq: 0,
                },
            );
            self.persist_locked(&inner, &job.id);
        }
        obs::emit_run_created(job.id.as_str(), &job.label);
        self.publish_status(&job);
        job
    }

    /// Merge `patch` into a run. A phase change is validated first; if it is
    /// rejected nothing is modified.
    pub fn update_run(&self, id: &RunId, patch: RunPatch) -> Result<Job> {
        let (from, job) = self.with_run(id, |entry| {
            let job = &mut entry.doc.run;
            let from = job.phase;
            if let Some(phase) = patch.phase {
                job.transition(phase)?;
            }
            if let Some(label) = patch.label {
                job.label = label;
            }
            if let Some(phase_label) = patch.phase_label {
                job.phase_label = phase_label;
            }
            if let Some(progress) = patch.progress {
                job.progress = progress.min(100);
            }
            if let Some(metrics) = patch.metrics {
                merge_metrics(&mut job.metrics, metrics);
            }
            if let Some(best) = patch.best_metric {
                job.best_metric = Some(best);
            }
            if let Some(error) = patch.error {
                job.error = Some(error);
            }
            if let Some(code) = patch.exit_code {
                job.exit_code = Some(code);
            }
            job.updated_at = Utc::now();
            Ok(from)
        })?;
        if from != job.phase {
            obs::emit_phase_changed(id.as_str(), from, job.phase);
        }
        self.publish_status(&job);
        Ok(job)
    }

    /// Run `f` against the stored job, then persist and publish it.
    ///
    /// Phase changes inside `f` must go through [`Job::transition`] or
    /// [`Job::observe_phase`].
    pub fn apply<R>(&self, id: &RunId, f: impl FnOnce(&mut Job) -> R) -> Result<R> {
        let ((out, from), job) = self.with_run(id, |entry| {
            let from = entry.doc.run.phase;
            Ok((f(&mut entry.doc.run), from))
        })?;
        if from != job.phase {
            obs::emit_phase_changed(id.as_str(), from, job.phase);
        }
        self.publish_status(&job);
        Ok(out)
    }

    /// Move a run to `phase`, enforcing the lifecycle state machine.
    pub fn transition(&self, id: &RunId, phase: Phase) -> Result<Job> {
        self.update_run(id, RunPatch::phase(phase))
    }

    pub fn pause_run(&self, id: &RunId) -> Result<Job> {
        self.transition(id, Phase::Paused)
    }

    /// Return a paused run to the phase it was paused from.
    pub fn resume_run(&self, id: &RunId) -> Result<Job> {
        let job = self
            .get_run(id)
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
        if job.phase != Phase::Paused {
            return Err(TransitionError {
                run_id: id.to_string(),
                from: job.phase.to_string(),
                to: "resumed".to_string(),
            }
            .into());
        }
        let target = job.paused_from.unwrap_or(Phase::Idle);
        self.transition(id, target)
    }

    pub fn stop_run(&self, id: &RunId) -> Result<Job> {
        self.transition(id, Phase::Stopped)
    }

    /// Mark a run failed with `message` and an optional worker exit code.
    pub fn fail_run(&self, id: &RunId, message: impl Into<String>, exit_code: Option<i32>) -> Result<Job> {
        self.update_run(
            id,
            RunPatch {
                phase: Some(Phase::Error),
                error: Some(message.into()),
                exit_code,
                ..RunPatch::default()
            },
        )
    }

    /// Mark a run completed; progress becomes 100.
    pub fn complete_run(&self, id: &RunId) -> Result<Job> {
        self.update_run(
            id,
            RunPatch {
                phase: Some(Phase::Completed),
                exit_code: Some(0),
                ..RunPatch::default()
            },
        )
    }

    /// Remove a run and everything recorded for it.
    pub fn delete_run(&self, id: &RunId) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.runs.remove(id.as_str()).is_none() {
            return Err(RegistryError::RunNotFound(id.to_string()));
        }
        inner.order.retain(|r| r != id);
        self.submit(id, WriteOp::Delete, true);
        info!(run_id = %id, "Deleted run");
        Ok(())
    }

    // -- metrics, logs, checkpoints -----------------------------------------

    pub fn append_metric(&self, sample: MetricSample) -> Result<()> {
        let id = sample.run_id.clone();
        {
            let mut inner = lock(&self.inner);
            let entry = inner
                .runs
                .get_mut(id.as_str())
                .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
            entry.doc.metrics.push(sample.clone());
            self.persist_locked(&inner, &id);
        }
        self.broadcaster.publish(StatusEvent::Metric(sample));
        Ok(())
    }

    /// Append a line to the run's bounded log, evicting the oldest on
    /// overflow.
    pub fn add_log(&self, id: &RunId, stream: LogStream, text: impl Into<String>) -> Result<LogLine> {
        let capacity = self.options.log_capacity.max(1);
        let mut inner = lock(&self.inner);
        let entry = inner
            .runs
            .get_mut(id.as_str())
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
        let line = LogLine {
            seq: entry.next_seq,
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        };
        entry.next_seq += 1;
        entry.doc.logs.push_back(line.clone());
        while entry.doc.logs.len() > capacity {
            entry.doc.logs.pop_front();
        }
        self.persist_locked(&inner, id);
        Ok(line)
    }

    /// Link a checkpoint to a run and make it the run's last checkpoint.
    pub fn add_checkpoint(&self, id: &RunId, checkpoint_id: impl Into<String>) -> Result<Job> {
        let checkpoint_id = checkpoint_id.into();
        let ((), job) = self.with_run(id, |entry| {
            entry.doc.checkpoints.push(checkpoint_id.clone());
            entry.doc.run.last_checkpoint = Some(checkpoint_id);
            entry.doc.run.updated_at = Utc::now();
            Ok(())
        })?;
        self.publish_status(&job);
        Ok(job)
    }

    // -- queries ------------------------------------------------------------

    pub fn get_run(&self, id: &RunId) -> Option<Job> {
        lock(&self.inner)
            .runs
            .get(id.as_str())
            .map(|e| e.doc.run.clone())
    }

    /// All runs in creation order.
    pub fn list_runs(&self) -> Vec<Job> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id.as_str()).map(|e| e.doc.run.clone()))
            .collect()
    }

    /// The most recently created run that has not reached a terminal phase.
    pub fn get_current_run(&self) -> Option<Job> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.runs.get(id.as_str()))
            .map(|e| &e.doc.run)
            .find(|job| !job.is_terminal())
            .cloned()
    }

    pub fn get_metrics(&self, id: &RunId) -> Result<Vec<MetricSample>> {
        self.read(id, |doc| doc.metrics.clone())
    }

    pub fn latest_metric(&self, id: &RunId) -> Result<Option<MetricSample>> {
        self.read(id, |doc| doc.metrics.last().cloned())
    }

    /// The newest `limit` log lines (default tail when `None`), oldest first.
    pub fn get_logs(&self, id: &RunId, limit: Option<usize>) -> Result<Vec<LogLine>> {
        let limit = limit.unwrap_or(self.options.default_log_tail);
        self.read(id, |doc| {
            let skip = doc.logs.len().saturating_sub(limit);
            doc.logs.iter().skip(skip).cloned().collect()
        })
    }

    /// Checkpoint ids linked to a run, oldest first.
    pub fn get_checkpoints(&self, id: &RunId) -> Result<Vec<String>> {
        self.read(id, |doc| doc.checkpoints.clone())
    }

    fn read<R>(&self, id: &RunId, f: impl FnOnce(&RunDocument) -> R) -> Result<R> {
        lock(&self.inner)
            .runs
            .get(id.as_str())
            .map(|e| f(&e.doc))
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))
    }

    /// The whole state as one four-map document.
    pub fn snapshot(&self) -> StateDocument {
        let inner = lock(&self.inner);
        StateDocument::from_runs(
            inner
                .order
                .iter()
                .filter_map(|id| inner.runs.get(id.as_str()).map(|e| e.doc.clone())),
        )
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let pending: Vec<WriteBarrier> = {
            let writers = lock(&self.writers);
            writers
                .live
                .values()
                .chain(writers.retiring.values())
                .map(RunWriter::barrier)
                .collect()
        };
        for barrier in pending {
            barrier.wait().await;
        }
        lock(&self.writers).drop_drained();
    }

    /// Runs that currently hold a writer task.
    pub fn live_writers(&self) -> usize {
        lock(&self.writers).live.len()
    }

    /// Total snapshots handed to the writers.
    pub fn writes_submitted(&self) -> u64 {
        self.persist_submitted.load(Ordering::Relaxed)
    }
}
