//! Filesystem helpers with operation + path context on errors.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result};

/// Create `path` and its parents if missing.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path("creating directory", path, e))
}

/// Size of the file at `path` in bytes.
pub async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| Error::io_path("reading metadata", path, e))
}

/// Delete a file. A file that is already gone is not an error.
///
/// Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing file", path, e)),
    }
}

/// Best-effort removal of several artifacts; failures are logged.
pub async fn remove_all_quietly<'a>(paths: impl IntoIterator<Item = &'a Path>) {
    for path in paths {
        if let Err(e) = remove_if_exists(path).await {
            warn!("Failed to clean up {}: {}", path.display(), e);
        }
    }
}

/// Remove the files directly under `dir` whose names start with `prefix`.
/// A missing directory counts as empty. Returns how many were removed.
pub async fn remove_with_prefix(dir: &Path, prefix: &str) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io_path("listing directory", dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("listing directory", dir, e))?
    {
        let matches = entry.file_name().to_str().is_some_and(|n| n.starts_with(prefix));
        if matches && remove_if_exists(&entry.path()).await? {
            removed += 1;
        }
    }
    Ok(removed)
}
