//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryStateStore` and `MemoryCheckpointStore` that satisfy the
//! trait contracts without touching the filesystem. Both support write
//! failure injection and count successful writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::schema::{CheckpointInfo, CheckpointRecord, CheckpointTag, RunDocument, RunId};
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory state store backed by a `HashMap<run_id, RunDocument>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    docs: Mutex<HashMap<String, RunDocument>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if a previous process had saved these documents.
    pub fn with_documents(docs: impl IntoIterator<Item = RunDocument>) -> Self {
        let store = Self::default();
        {
            let mut map = lock(&store.docs);
            for doc in docs {
                map.insert(doc.run.id.to_string(), doc);
            }
        }
        store
    }

    /// Make every subsequent save/delete fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Currently persisted document for a run.
    pub fn get(&self, run_id: &RunId) -> Option<RunDocument> {
        lock(&self.docs).get(run_id.as_str()).cloned()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(
                "failure injected by MemoryStateStore".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_all(&self) -> StorageResult<Vec<RunDocument>> {
        let mut docs: Vec<RunDocument> = lock(&self.docs).values().cloned().collect();
        docs.sort_by_key(|d| d.run.created_at);
        Ok(docs)
    }

    async fn save_run(&self, doc: &RunDocument) -> StorageResult<()> {
        self.check_writable()?;
        let mut doc = doc.clone();
        let mut docs = lock(&self.docs);
        if let Some(persisted) = docs.get(doc.run.id.as_str()) {
            doc.reconcile(persisted);
        }
        docs.insert(doc.run.id.to_string(), doc);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_run(&self, run_id: &RunId) -> StorageResult<()> {
        self.check_writable()?;
        lock(&self.docs).remove(run_id.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// In-memory checkpoint store backed by a `HashMap<checkpoint_id, record>`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, CheckpointRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save/delete fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite stored payload bytes without updating the digest.
    pub fn corrupt_payload(&self, checkpoint_id: &str, payload: Vec<u8>) {
        if let Some(record) = lock(&self.records).get_mut(checkpoint_id) {
            record.payload = payload;
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(
                "failure injected by MemoryCheckpointStore".to_string(),
            ));
        }
        Ok(())
    }

    fn holder(&self, run_id: &RunId, tag: CheckpointTag) -> Option<CheckpointRecord> {
        lock(&self.records)
            .values()
            .find(|r| &r.run_id == run_id && r.tag == tag)
            .cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(&self, request: SaveCheckpoint) -> StorageResult<CheckpointRecord> {
        self.check_writable()?;
        request.validate()?;

        let mut records = lock(&self.records);
        if records.contains_key(&request.checkpoint_id) {
            return Err(StorageError::InvalidCheckpoint {
                checkpoint_id: request.checkpoint_id,
                reason: "a checkpoint with this id already exists".to_string(),
            });
        }

        let existing: Vec<CheckpointInfo> = records
            .values()
            .filter(|r| r.run_id == request.run_id)
            .map(CheckpointRecord::info)
            .collect();
        let plan = plan_tags(&request, &existing);
        for id in &plan.demote {
            if let Some(r) = records.get_mut(id) {
                r.tag = CheckpointTag::Manual;
            }
        }

        let record = CheckpointRecord {
            locator: format!("memory://{}", request.checkpoint_id),
            id: request.checkpoint_id,
            run_id: request.run_id,
            created_at: Utc::now(),
            payload_digest: CheckpointRecord::digest_payload(&request.payload),
            payload: request.payload,
            resume_token: request.resume_token,
            tag: plan.tag,
            metric: request.metric,
        };
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn load_checkpoint(&self, checkpoint_id: &str) -> StorageResult<CheckpointRecord> {
        let record = lock(&self.records)
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| StorageError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })?;
        record.verify()?;
        Ok(record)
    }

    async fn list_checkpoints(
        &self,
        run_id: Option<&RunId>,
    ) -> StorageResult<Vec<CheckpointInfo>> {
        let mut infos: Vec<CheckpointInfo> = lock(&self.records)
            .values()
            .filter(|r| run_id.map_or(true, |id| &r.run_id == id))
            .map(CheckpointRecord::info)
            .collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(infos)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StorageResult<()> {
        self.check_writable()?;
        lock(&self.records)
            .remove(checkpoint_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    async fn latest_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>> {
        Ok(self.holder(run_id, CheckpointTag::Latest))
    }

    async fn best_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>> {
        Ok(self.holder(run_id, CheckpointTag::Best))
    }
}
