use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Write `bytes` to `path` via a temp file in the same directory and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::io(path, std::io::ErrorKind::InvalidInput.into()))?;
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StorageError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Run blocking filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| StorageError::Io {
        path: String::from("<blocking task>"),
        source: std::io::Error::other(e.to_string()),
    })?
}
