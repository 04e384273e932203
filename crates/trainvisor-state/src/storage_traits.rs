//! Storage trait definitions for Trainvisor
//!
//! These traits define the two persistence seams:
//! - `StateStore`: per-run documents (run record, metrics, log tail, checkpoint ids)
//! - `CheckpointStore`: checkpoint payloads with `latest`/`best` aliases
//!
//! All traits are async and backend-agnostic. Filesystem implementations
//! live in `fs_state` / `fs_checkpoints`; in-memory fakes in `fakes`.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    is_path_safe, CheckpointInfo, CheckpointRecord, CheckpointTag, MetricGoal, RunDocument, RunId,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Durable home of run documents.
///
/// Guarantees:
/// - `save_run(doc)` replaces the document for `doc.run.id`, after
///   [`RunDocument::reconcile`] with the persisted one: checkpoint links
///   are never dropped and a terminal run never becomes active again.
/// - `load_all()` returns every document previously saved and not deleted.
/// - A failed save leaves the previous document intact.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted run document.
    async fn load_all(&self) -> StorageResult<Vec<RunDocument>>;

    /// Replace the persisted document for one run, keeping its existing
    /// checkpoint links.
    async fn save_run(&self, doc: &RunDocument) -> StorageResult<()>;

    /// Remove a run's document. No-op if absent.
    async fn delete_run(&self, run_id: &RunId) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Request to persist a checkpoint.
#[derive(Debug, Clone)]
pub struct SaveCheckpoint {
    pub run_id: RunId,
    pub checkpoint_id: String,
    pub payload: Vec<u8>,
    pub resume_token: Option<String>,
    /// Requested tag; `Best` may be downgraded to `Manual`
    pub tag: CheckpointTag,
    pub metric: Option<f64>,
    pub goal: MetricGoal,
}

impl SaveCheckpoint {
    pub fn new(run_id: RunId, checkpoint_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            run_id,
            checkpoint_id: checkpoint_id.into(),
            payload,
            resume_token: None,
            tag: CheckpointTag::Manual,
            metric: None,
            goal: MetricGoal::default(),
        }
    }

    pub fn with_tag(mut self, tag: CheckpointTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_goal(mut self, goal: MetricGoal) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    /// Reject requests that cannot be stored.
    pub fn validate(&self) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidCheckpoint {
            checkpoint_id: self.checkpoint_id.clone(),
            reason: reason.to_string(),
        };
        if !is_path_safe(&self.checkpoint_id) {
            return Err(invalid(
                "id must be non-empty and use only [A-Za-z0-9._-]",
            ));
        }
        if !is_path_safe(self.run_id.as_str()) {
            return Err(invalid("run id is not a valid file name"));
        }
        match self.metric {
            Some(m) if !m.is_finite() => return Err(invalid("metric must be finite")),
            None if self.tag == CheckpointTag::Best => {
                return Err(invalid("a best checkpoint requires a metric"))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Outcome of resolving a requested tag against a run's existing checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPlan {
    /// Tag the new checkpoint is stored with
    pub tag: CheckpointTag,
    /// Existing checkpoints to re-tag as `Manual`
    pub demote: Vec<String>,
}

/// Decide the stored tag and the demotions for a save request.
///
/// `existing` holds the checkpoints already stored for the request's run.
/// A `Latest` request always wins; a `Best` request wins only when its
/// metric strictly beats the current best holder under `goal`.
pub fn plan_tags(request: &SaveCheckpoint, existing: &[CheckpointInfo]) -> TagPlan {
    let holders = |tag: CheckpointTag| -> Vec<&CheckpointInfo> {
        existing
            .iter()
            .filter(|c| c.tag == tag && c.id != request.checkpoint_id)
            .collect()
    };

    match request.tag {
        CheckpointTag::Manual => TagPlan {
            tag: CheckpointTag::Manual,
            demote: Vec::new(),
        },
        CheckpointTag::Latest => TagPlan {
            tag: CheckpointTag::Latest,
            demote: holders(CheckpointTag::Latest)
                .into_iter()
                .map(|c| c.id.clone())
                .collect(),
        },
        CheckpointTag::Best => {
            let current = holders(CheckpointTag::Best);
            let candidate = request.metric.unwrap_or(f64::NAN);
            let wins = current.iter().all(|c| match c.metric {
                Some(incumbent) => request.goal.is_better(candidate, incumbent),
                None => true,
            });
            if wins {
                TagPlan {
                    tag: CheckpointTag::Best,
                    demote: current.into_iter().map(|c| c.id.clone()).collect(),
                }
            } else {
                TagPlan {
                    tag: CheckpointTag::Manual,
                    demote: Vec::new(),
                }
            }
        }
    }
}

/// Checkpoint persistence with per-run `latest` and `best` aliases.
///
/// Guarantees:
/// - `load_checkpoint(id)` returns the exact payload that was saved, or
///   `DigestMismatch` if the stored bytes no longer hash to the digest.
/// - Each run has at most one `latest` and one `best` holder.
/// - `list_checkpoints` is ordered newest first.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint and return the stored record.
    async fn save_checkpoint(&self, request: SaveCheckpoint) -> StorageResult<CheckpointRecord>;

    /// Load and verify one checkpoint.
    async fn load_checkpoint(&self, checkpoint_id: &str) -> StorageResult<CheckpointRecord>;

    /// Checkpoint metadata, newest first, optionally for a single run.
    async fn list_checkpoints(&self, run_id: Option<&RunId>)
        -> StorageResult<Vec<CheckpointInfo>>;

    /// Delete a checkpoint, clearing any alias that points at it.
    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StorageResult<()>;

    /// The run's current `latest` checkpoint.
    async fn latest_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>>;

    /// The run's current `best` checkpoint.
    async fn best_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>>;
}
