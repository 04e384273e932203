//! Filesystem-backed [`CheckpointStore`].
//!
//! Layout:
//! - `<root>/records/<checkpoint_id>.json`: metadata only
//! - `<root>/records/<checkpoint_id>.bin`: raw payload bytes
//! - `<root>/aliases/<run_id>/latest`, `<root>/aliases/<run_id>/best`: the
//!   id of the current holder
//!
//! Tag planning and listing read metadata files only; payloads are read by
//! `load_checkpoint` and alias resolution. The payload is written before its
//! metadata, so a record is visible only once both exist. All writes go
//! through a temp file and rename. Mutations are serialized by an async lock
//! so alias repointing and demotion never interleave.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::fs_util::{blocking, remove_if_exists, write_atomic};
use crate::schema::{is_path_safe, CheckpointInfo, CheckpointRecord, CheckpointTag, RunId};
use crate::storage_traits::{plan_tags, CheckpointStore, SaveCheckpoint, StorageResult};

/// On-disk metadata for one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeta {
    id: String,
    run_id: RunId,
    created_at: DateTime<Utc>,
    locator: String,
    payload_digest: String,
    payload_len: u64,
    #[serde(default)]
    resume_token: Option<String>,
    tag: CheckpointTag,
    #[serde(default)]
    metric: Option<f64>,
}

impl StoredMeta {
    fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            created_at: self.created_at,
            locator: self.locator.clone(),
            tag: self.tag,
            metric: self.metric,
            payload_digest: self.payload_digest.clone(),
            payload_len: self.payload_len,
            has_resume_token: self.resume_token.is_some(),
        }
    }

    fn into_record(self, payload: Vec<u8>) -> CheckpointRecord {
        CheckpointRecord {
            id: self.id,
            run_id: self.run_id,
            created_at: self.created_at,
            locator: self.locator,
            payload,
            payload_digest: self.payload_digest,
            resume_token: self.resume_token,
            tag: self.tag,
            metric: self.metric,
        }
    }
}

fn not_found(checkpoint_id: &str) -> StorageError {
    StorageError::CheckpointNotFound {
        checkpoint_id: checkpoint_id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Layout {
    records_dir: PathBuf,
    aliases_dir: PathBuf,
}

impl Layout {
    fn record_path(&self, checkpoint_id: &str, ext: &str) -> StorageResult<PathBuf> {
        if !is_path_safe(checkpoint_id) {
            return Err(not_found(checkpoint_id));
        }
        Ok(self.records_dir.join(format!("{checkpoint_id}.{ext}")))
    }

    fn meta_path(&self, checkpoint_id: &str) -> StorageResult<PathBuf> {
        self.record_path(checkpoint_id, "json")
    }

    fn payload_path(&self, checkpoint_id: &str) -> StorageResult<PathBuf> {
        self.record_path(checkpoint_id, "bin")
    }

    fn alias_path(&self, run_id: &RunId, tag: CheckpointTag) -> PathBuf {
        self.aliases_dir.join(run_id.as_str()).join(tag.as_str())
    }

    fn read_meta(&self, checkpoint_id: &str) -> StorageResult<StoredMeta> {
        let path = self.meta_path(checkpoint_id)?;
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found(checkpoint_id)
            } else {
                StorageError::io(&path, e)
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Deserialization {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn write_meta(&self, meta: &StoredMeta) -> StorageResult<()> {
        let path = self.meta_path(&meta.id)?;
        write_atomic(&path, &serde_json::to_vec_pretty(meta)?)
    }

    fn read_record(&self, checkpoint_id: &str) -> StorageResult<CheckpointRecord> {
        let meta = self.read_meta(checkpoint_id)?;
        let path = self.payload_path(checkpoint_id)?;
        let payload = fs::read(&path).map_err(|e| StorageError::io(&path, e))?;
        Ok(meta.into_record(payload))
    }

    fn read_alias(&self, run_id: &RunId, tag: CheckpointTag) -> StorageResult<Option<String>> {
        let path = self.alias_path(run_id, tag);
        match fs::read_to_string(&path) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    fn resolve_alias(
        &self,
        run_id: &RunId,
        tag: CheckpointTag,
    ) -> StorageResult<Option<CheckpointRecord>> {
        let Some(id) = self.read_alias(run_id, tag)? else {
            return Ok(None);
        };
        match self.read_record(&id) {
            Ok(record) => {
                record.verify()?;
                Ok(Some(record))
            }
            Err(e) if e.is_not_found() => {
                warn!(run_id = %run_id, checkpoint_id = %id, alias = %tag, "Alias points at a missing checkpoint");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Metadata of every readable record, newest first, optionally
    /// restricted to one run.
    fn scan(&self, run_id: Option<&RunId>) -> StorageResult<Vec<StoredMeta>> {
        let mut metas = Vec::new();
        let entries =
            fs::read_dir(&self.records_dir).map_err(|e| StorageError::io(&self.records_dir, e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| StorageError::io(&self.records_dir, e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<StoredMeta>(&b).map_err(|e| e.to_string()));
            match parsed {
                Ok(meta) if run_id.map_or(true, |r| &meta.run_id == r) => metas.push(meta),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint record"),
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(metas)
    }

    fn save(&self, request: SaveCheckpoint) -> StorageResult<CheckpointRecord> {
        request.validate()?;
        let meta_path = self.meta_path(&request.checkpoint_id)?;
        if meta_path.exists() {
            return Err(StorageError::InvalidCheckpoint {
                checkpoint_id: request.checkpoint_id,
                reason: "a checkpoint with this id already exists".to_string(),
            });
        }

        let existing: Vec<CheckpointInfo> = self
            .scan(Some(&request.run_id))?
            .iter()
            .map(StoredMeta::info)
            .collect();
        let plan = plan_tags(&request, &existing);

        let payload_path = self.payload_path(&request.checkpoint_id)?;
        write_atomic(&payload_path, &request.payload)?;
        let meta = StoredMeta {
            id: request.checkpoint_id,
            run_id: request.run_id,
            created_at: Utc::now(),
            locator: payload_path.display().to_string(),
            payload_digest: CheckpointRecord::digest_payload(&request.payload),
            payload_len: request.payload.len() as u64,
            resume_token: request.resume_token,
            tag: plan.tag,
            metric: request.metric,
        };
        self.write_meta(&meta)?;

        if plan.tag != CheckpointTag::Manual {
            write_atomic(&self.alias_path(&meta.run_id, plan.tag), meta.id.as_bytes())?;
        }
        for id in &plan.demote {
            let mut demoted = self.read_meta(id)?;
            demoted.tag = CheckpointTag::Manual;
            self.write_meta(&demoted)?;
            debug!(checkpoint_id = %id, "Demoted checkpoint to manual");
        }
        Ok(meta.into_record(request.payload))
    }

    fn delete(&self, checkpoint_id: &str) -> StorageResult<()> {
        let meta = self.read_meta(checkpoint_id)?;
        remove_if_exists(&self.meta_path(checkpoint_id)?)?;
        remove_if_exists(&self.payload_path(checkpoint_id)?)?;
        for tag in [CheckpointTag::Latest, CheckpointTag::Best] {
            if self.read_alias(&meta.run_id, tag)?.as_deref() == Some(checkpoint_id) {
                remove_if_exists(&self.alias_path(&meta.run_id, tag))?;
            }
        }
        Ok(())
    }
}

pub struct FsCheckpointStore {
    layout: Layout,
    write_lock: Mutex<()>,
}

impl FsCheckpointStore {
    /// Create a store rooted at `root`. Creates `records/` and `aliases/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let layout = Layout {
            records_dir: root.as_ref().join("records"),
            aliases_dir: root.as_ref().join("aliases"),
        };
        for dir in [&layout.records_dir, &layout.aliases_dir] {
            fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        }
        Ok(Self {
            layout,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save_checkpoint(&self, request: SaveCheckpoint) -> StorageResult<CheckpointRecord> {
        let _guard = self.write_lock.lock().await;
        let layout = self.layout.clone();
        blocking(move || layout.save(request)).await
    }

    async fn load_checkpoint(&self, checkpoint_id: &str) -> StorageResult<CheckpointRecord> {
        let layout = self.layout.clone();
        let id = checkpoint_id.to_string();
        let record = blocking(move || layout.read_record(&id)).await?;
        record.verify()?;
        Ok(record)
    }

    async fn list_checkpoints(
        &self,
        run_id: Option<&RunId>,
    ) -> StorageResult<Vec<CheckpointInfo>> {
        let layout = self.layout.clone();
        let run_id = run_id.cloned();
        let metas = blocking(move || layout.scan(run_id.as_ref())).await?;
        Ok(metas.iter().map(StoredMeta::info).collect())
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let layout = self.layout.clone();
        let id = checkpoint_id.to_string();
        blocking(move || layout.delete(&id)).await
    }

    async fn latest_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>> {
        let layout = self.layout.clone();
        let run_id = run_id.clone();
        blocking(move || layout.resolve_alias(&run_id, CheckpointTag::Latest)).await
    }

    async fn best_for_run(&self, run_id: &RunId) -> StorageResult<Option<CheckpointRecord>> {
        let layout = self.layout.clone();
        let run_id = run_id.clone();
        blocking(move || layout.resolve_alias(&run_id, CheckpointTag::Best)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn run() -> RunId {
        RunId::from("run-1")
    }

    #[tokio::test]
    async fn payload_survives_save_and_load() {
        let (_dir, store) = make_store();
        let payload: Vec<u8> = (0..=255).collect();
        store
            .save_checkpoint(
                SaveCheckpoint::new(run(), "c1", payload.clone()).with_resume_token("step=40"),
            )
            .await
            .unwrap();

        let loaded = store.load_checkpoint("c1").await.unwrap();
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.resume_token.as_deref(), Some("step=40"));
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let (dir, store) = make_store();
        store
            .save_checkpoint(SaveCheckpoint::new(run(), "c1", b"weights".to_vec()))
            .await
            .unwrap();

        fs::write(dir.path().join("records").join("c1.bin"), b"tampered").unwrap();

        let err = store.load_checkpoint("c1").await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn metadata_files_carry_no_payload() {
        let (dir, store) = make_store();
        let payload = vec![7u8; 4096];
        let record = store
            .save_checkpoint(SaveCheckpoint::new(run(), "c1", payload.clone()))
            .await
            .unwrap();

        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("records/c1.json")).unwrap())
                .unwrap();
        assert!(meta.get("payload").is_none());
        assert_eq!(meta["payloadLen"], 4096);
        assert_eq!(fs::read(dir.path().join("records/c1.bin")).unwrap(), payload);
        assert!(record.locator.ends_with("c1.bin"));

        // Listing only needs metadata.
        fs::remove_file(dir.path().join("records/c1.bin")).unwrap();
        let infos = store.list_checkpoints(None).await.unwrap();
        assert_eq!(infos[0].payload_len, 4096);
    }

    #[tokio::test]
    async fn delete_removes_payload_file() {
        let (dir, store) = make_store();
        store
            .save_checkpoint(SaveCheckpoint::new(run(), "c1", vec![1, 2, 3]))
            .await
            .unwrap();
        store.delete_checkpoint("c1").await.unwrap();
        assert!(!dir.path().join("records/c1.bin").exists());
        assert!(!dir.path().join("records/c1.json").exists());
    }

    #[tokio::test]
    async fn latest_alias_moves_and_demotes() {
        let (dir, store) = make_store();
        for id in ["c1", "c2"] {
            store
                .save_checkpoint(
                    SaveCheckpoint::new(run(), id, id.as_bytes().to_vec())
                        .with_tag(CheckpointTag::Latest),
                )
                .await
                .unwrap();
        }

        let latest = store.latest_for_run(&run()).await.unwrap().unwrap();
        assert_eq!(latest.id, "c2");
        assert_eq!(
            store.load_checkpoint("c1").await.unwrap().tag,
            CheckpointTag::Manual
        );
        let alias = fs::read_to_string(dir.path().join("aliases/run-1/latest")).unwrap();
        assert_eq!(alias, "c2");
    }

    #[tokio::test]
    async fn worse_best_is_stored_as_manual() {
        let (_dir, store) = make_store();
        let best = |id: &str, metric: f64| {
            SaveCheckpoint::new(run(), id, b"w".to_vec())
                .with_tag(CheckpointTag::Best)
                .with_metric(metric)
        };
        store.save_checkpoint(best("c1", 0.5)).await.unwrap();
        let second = store.save_checkpoint(best("c2", 0.7)).await.unwrap();
        assert_eq!(second.tag, CheckpointTag::Manual);
        assert_eq!(store.best_for_run(&run()).await.unwrap().unwrap().id, "c1");

        store.save_checkpoint(best("c3", 0.3)).await.unwrap();
        assert_eq!(store.best_for_run(&run()).await.unwrap().unwrap().id, "c3");
        assert_eq!(
            store.load_checkpoint("c1").await.unwrap().tag,
            CheckpointTag::Manual
        );
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let (_dir, store) = make_store();
        store
            .save_checkpoint(SaveCheckpoint::new(run(), "a", vec![1]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .save_checkpoint(SaveCheckpoint::new(RunId::from("run-2"), "b", vec![2]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .save_checkpoint(SaveCheckpoint::new(run(), "c", vec![3]))
            .await
            .unwrap();

        let all: Vec<String> = store
            .list_checkpoints(None)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(all, vec!["c", "b", "a"]);

        let mine = store.list_checkpoints(Some(&run())).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|c| c.run_id == run()));
    }

    #[tokio::test]
    async fn delete_clears_alias() {
        let (_dir, store) = make_store();
        store
            .save_checkpoint(
                SaveCheckpoint::new(run(), "c1", vec![1]).with_tag(CheckpointTag::Latest),
            )
            .await
            .unwrap();
        store.delete_checkpoint("c1").await.unwrap();

        assert!(store.latest_for_run(&run()).await.unwrap().is_none());
        assert!(store.load_checkpoint("c1").await.unwrap_err().is_not_found());
        assert!(store.delete_checkpoint("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (_dir, store) = make_store();
        store
            .save_checkpoint(SaveCheckpoint::new(run(), "c1", vec![1]))
            .await
            .unwrap();
        let err = store
            .save_checkpoint(SaveCheckpoint::new(run(), "c1", vec![2]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidCheckpoint { .. }));
        assert_eq!(store.load_checkpoint("c1").await.unwrap().payload, vec![1]);
    }
}
