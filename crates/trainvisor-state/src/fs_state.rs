//! Filesystem-backed [`StateStore`].
//!
//! Layout: `<state_dir>/runs/<run_id>.json`, one pretty-printed
//! [`RunDocument`] per run, each replaced atomically. Every save is
//! reconciled with the file it replaces, so a second process linking a
//! checkpoint to a run is not undone by the supervising process.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::error::StorageError;
use crate::fs_util::{blocking, remove_if_exists, write_atomic};
use crate::schema::{is_path_safe, RunDocument, RunId};
use crate::storage_traits::{StateStore, StorageResult};

pub struct FsStateStore {
    runs_dir: PathBuf,
}

impl FsStateStore {
    /// Create a store rooted at `state_dir`. Creates `state_dir/runs/` if needed.
    pub fn new(state_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = state_dir.as_ref().join("runs");
        fs::create_dir_all(&runs_dir).map_err(|e| StorageError::io(&runs_dir, e))?;
        Ok(Self { runs_dir })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn run_path(&self, run_id: &RunId) -> StorageResult<PathBuf> {
        if !is_path_safe(run_id.as_str()) {
            return Err(StorageError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(self.runs_dir.join(format!("{}.json", run_id)))
    }
}

/// The document currently at `path`; `None` if absent or unreadable.
fn read_document(path: &Path) -> StorageResult<Option<RunDocument>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(doc) => Ok(Some(doc)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Replacing unreadable run document");
            Ok(None)
        }
    }
}

fn read_documents(dir: &Path) -> StorageResult<Vec<RunDocument>> {
    let mut docs = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| StorageError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = fs::read(&path).map_err(|e| StorageError::io(&path, e))?;
        match serde_json::from_slice::<RunDocument>(&bytes) {
            Ok(doc) => docs.push(doc),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run document"),
        }
    }
    docs.sort_by_key(|d| d.run.created_at);
    Ok(docs)
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn load_all(&self) -> StorageResult<Vec<RunDocument>> {
        let dir = self.runs_dir.clone();
        blocking(move || read_documents(&dir)).await
    }

    async fn save_run(&self, doc: &RunDocument) -> StorageResult<()> {
        let path = self.run_path(&doc.run.id)?;
        let mut doc = doc.clone();
        blocking(move || {
            if let Some(persisted) = read_document(&path)? {
                doc.reconcile(&persisted);
            }
            write_atomic(&path, &serde_json::to_vec_pretty(&doc)?)
        })
        .await
    }

    async fn delete_run(&self, run_id: &RunId) -> StorageResult<()> {
        let path = self.run_path(run_id)?;
        blocking(move || remove_if_exists(&path)).await
    }
}
