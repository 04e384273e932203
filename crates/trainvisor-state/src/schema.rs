//! Schema definitions for persisted Trainvisor state
//!
//! Records:
//! - `Job`: one training run, its configuration and lifecycle phase
//! - `MetricSample`: append-only metric history entries
//! - `LogLine`: entries of the bounded per-run log tail
//! - `CheckpointRecord`: checkpoint payload plus metadata
//! - `RunDocument` / `StateDocument`: the persisted shapes

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StorageError, TransitionError};

/// Serialize raw bytes as a lowercase hex string.
mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}

/// Whether an identifier can be used verbatim as a file name.
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Unique identifier for a training run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new id of the form `run_<unix millis>_<8 hex chars>`.
    pub fn new() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!(
            "run_{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a run.
///
/// Forward path: `Idle → Preparing → Training → Evaluating → Completed`.
/// `Paused` cycles back to the phase it was entered from; `Completed`,
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preparing,
    Training,
    Evaluating,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Training => "training",
            Phase::Evaluating => "evaluating",
            Phase::Paused => "paused",
            Phase::Completed => "completed",
            Phase::Stopped => "stopped",
            Phase::Error => "error",
        }
    }

    /// Human-readable label shown next to the phase.
    pub fn default_label(&self) -> &'static str {
        match self {
            Phase::Idle => "Initializing",
            Phase::Preparing => "Preparing dataset",
            Phase::Training => "Training model",
            Phase::Evaluating => "Evaluating model",
            Phase::Paused => "Paused",
            Phase::Completed => "Completed",
            Phase::Stopped => "Stopped",
            Phase::Error => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Stopped | Phase::Error)
    }

    /// Position on the forward path; `None` for paused/stopped/error.
    fn rank(&self) -> Option<u8> {
        match self {
            Phase::Idle => Some(0),
            Phase::Preparing => Some(1),
            Phase::Training => Some(2),
            Phase::Evaluating => Some(3),
            Phase::Completed => Some(4),
            Phase::Paused | Phase::Stopped | Phase::Error => None,
        }
    }

    /// Strictly later on the forward path than `other`.
    fn is_after(&self, other: Phase) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Training configuration
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Resolved configuration handed to the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingConfig {
    /// Path to the base model weights
    pub base_model: PathBuf,
    /// Path to the training dataset
    pub dataset: PathBuf,
    /// Directory the worker writes its artifacts to
    pub output_dir: PathBuf,
    pub epochs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    pub learning_rate: f64,
    pub batch_size: u32,
    /// Steps between save-points, forwarded to the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    /// Checkpoint id to resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_checkpoint: Option<String>,
}

impl TrainingConfig {
    /// Create a configuration with the default hyper-parameters
    /// (10 epochs, learning rate 1e-4, batch size 16).
    pub fn new(
        base_model: impl Into<PathBuf>,
        dataset: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_model: base_model.into(),
            dataset: dataset.into(),
            output_dir: output_dir.into(),
            epochs: 10,
            max_steps: None,
            learning_rate: 1e-4,
            batch_size: 16,
            checkpoint_interval: None,
            seed: None,
            use_gpu: true,
            resume_checkpoint: None,
        }
    }

    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_checkpoint_interval(mut self, steps: u64) -> Self {
        self.checkpoint_interval = Some(steps);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn cpu_only(mut self) -> Self {
        self.use_gpu = false;
        self
    }

    pub fn resume_from(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.resume_checkpoint = Some(checkpoint_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Most recent values reported by the worker.
///
/// Every field is optional: a value stays `None` until the worker reports
/// it and is never reset afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

/// A training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: RunId,
    pub label: String,
    pub config: TrainingConfig,
    pub phase: Phase,
    pub phase_label: String,
    /// Phase to return to when a paused run resumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<Phase>,
    /// Percentage 0..=100
    pub progress: u8,
    pub target_epochs: u32,
    #[serde(default)]
    pub metrics: LiveMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
}

impl Job {
    /// Create a new run in phase `Idle`.
    pub fn new(id: RunId, label: impl Into<String>, config: TrainingConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: label.into(),
            target_epochs: config.epochs,
            config,
            phase: Phase::Idle,
            phase_label: Phase::Idle.default_label().to_string(),
            paused_from: None,
            progress: 0,
            metrics: LiveMetrics::default(),
            best_metric: None,
            error: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_checkpoint: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn current_epoch(&self) -> u32 {
        self.metrics.epoch.unwrap_or(0)
    }

    pub fn current_step(&self) -> u64 {
        self.metrics.step.unwrap_or(0)
    }

    /// Whether `next` is a legal phase change from the current phase.
    ///
    /// Staying in the same phase is not a change and returns `false`.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        let from = self.phase;
        if from.is_terminal() || from == next {
            return false;
        }
        match next {
            Phase::Stopped | Phase::Error => true,
            Phase::Paused => true,
            _ if from == Phase::Paused => {
                let base = self.paused_from.unwrap_or(Phase::Idle);
                next == base || next.is_after(base)
            }
            _ => next.is_after(from),
        }
    }

    /// Move to `next`, stamping timestamps and the phase label.
    ///
    /// Re-entering the current phase is a no-op.
    pub fn transition(&mut self, next: Phase) -> Result<(), TransitionError> {
        if self.phase == next {
            return Ok(());
        }
        if !self.can_transition_to(next) {
            return Err(TransitionError {
                run_id: self.id.to_string(),
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        self.paused_from = if next == Phase::Paused {
            Some(self.phase)
        } else {
            None
        };
        self.phase = next;
        self.phase_label = next.default_label().to_string();
        if next == Phase::Preparing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next == Phase::Completed {
            self.progress = 100;
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Apply a phase reported by the worker's own output.
    ///
    /// Only forward moves are honoured. While paused, the observed phase is
    /// remembered as the phase to resume into. Returns whether anything
    /// changed.
    pub fn observe_phase(&mut self, observed: Phase) -> bool {
        if self.phase == Phase::Paused {
            let base = self.paused_from.unwrap_or(Phase::Idle);
            if observed.is_after(base) && observed != Phase::Completed {
                self.paused_from = Some(observed);
                self.updated_at = Utc::now();
                return true;
            }
            return false;
        }
        if observed.is_after(self.phase) && observed != Phase::Completed {
            return self.transition(observed).is_ok();
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Metrics & logs
// ---------------------------------------------------------------------------

/// One immutable entry of a run's metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub epoch: u32,
    pub step: u64,
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

impl MetricSample {
    /// Build a sample from a run's current live metrics, if a loss is known.
    pub fn from_job(job: &Job) -> Option<Self> {
        let loss = job.metrics.loss?;
        Some(Self {
            run_id: job.id.clone(),
            timestamp: Utc::now(),
            epoch: job.current_epoch(),
            step: job.current_step(),
            loss,
            val_loss: job.metrics.val_loss,
            accuracy: job.metrics.accuracy,
            learning_rate: job.metrics.learning_rate,
        })
    }
}

/// Source of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the orchestrator itself
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointTag {
    Latest,
    Best,
    Manual,
}

impl CheckpointTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTag::Latest => "latest",
            CheckpointTag::Best => "best",
            CheckpointTag::Manual => "manual",
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction in which a checkpoint metric improves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGoal {
    /// Lower is better (loss)
    #[default]
    Minimize,
    /// Higher is better (accuracy)
    Maximize,
}

impl MetricGoal {
    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            MetricGoal::Minimize => candidate < incumbent,
            MetricGoal::Maximize => candidate > incumbent,
        }
    }
}

/// Full checkpoint record as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub id: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    /// Where the backend keeps this record
    pub locator: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// SHA-256 hex of `payload`
    pub payload_digest: String,
    /// Opaque worker data, returned verbatim
    #[serde(default)]
    pub resume_token: Option<String>,
    pub tag: CheckpointTag,
    #[serde(default)]
    pub metric: Option<f64>,
}

impl CheckpointRecord {
    pub fn digest_payload(payload: &[u8]) -> String {
        hex::encode(Sha256::digest(payload))
    }

    /// Check the payload against the recorded digest.
    pub fn verify(&self) -> Result<(), StorageError> {
        let actual = Self::digest_payload(&self.payload);
        if actual != self.payload_digest {
            return Err(StorageError::DigestMismatch {
                checkpoint_id: self.id.clone(),
                expected: self.payload_digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Metadata view without the payload.
    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            created_at: self.created_at,
            locator: self.locator.clone(),
            tag: self.tag,
            metric: self.metric,
            payload_digest: self.payload_digest.clone(),
            payload_len: self.payload.len() as u64,
            has_resume_token: self.resume_token.is_some(),
        }
    }
}

/// Checkpoint metadata returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfo {
    pub id: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub locator: String,
    pub tag: CheckpointTag,
    pub metric: Option<f64>,
    pub payload_digest: String,
    pub payload_len: u64,
    pub has_resume_token: bool,
}

// ---------------------------------------------------------------------------
// Persisted documents
// ---------------------------------------------------------------------------

/// Everything persisted for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDocument {
    pub run: Job,
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
    #[serde(default)]
    pub logs: VecDeque<LogLine>,
    /// Checkpoint ids, oldest first
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

impl RunDocument {
    pub fn new(run: Job) -> Self {
        Self {
            run,
            metrics: Vec::new(),
            logs: VecDeque::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Fold in what another writer may have persisted for this run since
    /// this copy was taken.
    ///
    /// Checkpoint links are append-only: links already in `persisted` are
    /// kept, and `last_checkpoint` is whichever link sorts last in the
    /// merged list. A terminal `persisted` run is never replaced by an
    /// active one; only the new links are added to it.
    pub fn reconcile(&mut self, persisted: &RunDocument) {
        if persisted.run.is_terminal() && !self.run.is_terminal() {
            let stale = std::mem::replace(self, persisted.clone());
            self.merge_links(persisted, &stale);
        } else {
            let newer = self.clone();
            self.merge_links(persisted, &newer);
        }
    }

    fn merge_links(&mut self, base: &RunDocument, newer: &RunDocument) {
        let mut links = base.checkpoints.clone();
        for id in &newer.checkpoints {
            if !links.contains(id) {
                links.push(id.clone());
            }
        }
        let position =
            |id: &Option<String>| id.as_ref().and_then(|id| links.iter().position(|l| l == id));
        let last = [&base.run.last_checkpoint, &newer.run.last_checkpoint]
            .into_iter()
            .max_by_key(|id| (position(id), id.is_some()))
            .cloned()
            .flatten();
        if self.run.best_metric.is_none() {
            self.run.best_metric = base.run.best_metric.or(newer.run.best_metric);
        }
        self.run.last_checkpoint = last;
        self.checkpoints = links;
    }
}

/// Whole orchestrator state: four maps keyed by run id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub runs: BTreeMap<String, Job>,
    pub metrics: BTreeMap<String, Vec<MetricSample>>,
    pub logs: BTreeMap<String, VecDeque<LogLine>>,
    pub checkpoints: BTreeMap<String, Vec<String>>,
}

impl StateDocument {
    pub fn from_runs(docs: impl IntoIterator<Item = RunDocument>) -> Self {
        let mut state = StateDocument::default();
        for doc in docs {
            let key = doc.run.id.to_string();
            state.metrics.insert(key.clone(), doc.metrics);
            state.logs.insert(key.clone(), doc.logs);
            state.checkpoints.insert(key.clone(), doc.checkpoints);
            state.runs.insert(key, doc.run);
        }
        state
    }

    /// Split back into per-run documents, ordered by creation time.
    pub fn into_runs(mut self) -> Vec<RunDocument> {
        let mut docs: Vec<RunDocument> = std::mem::take(&mut self.runs)
            .into_iter()
            .map(|(key, run)| RunDocument {
                run,
                metrics: self.metrics.remove(&key).unwrap_or_default(),
                logs: self.logs.remove(&key).unwrap_or_default(),
                checkpoints: self.checkpoints.remove(&key).unwrap_or_default(),
            })
            .collect();
        docs.sort_by_key(|d| d.run.created_at);
        docs
    }
}
