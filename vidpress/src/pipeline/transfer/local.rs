//! Filesystem-backed transfer collaborator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{TransferClient, UploadMetadata};
use crate::pipeline::progress::ProgressSink;
use crate::utils::fs::{ensure_dir_all, remove_if_exists};
use crate::{Error, Result};

const CHUNK_SIZE: usize = 256 * 1024;

/// Treats source references as local paths: downloads copy them into the work
/// directory and uploads copy results into an outbox directory.
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    work_dir: PathBuf,
    outbox_dir: PathBuf,
}

impl LocalTransfer {
    pub fn new(work_dir: impl Into<PathBuf>, outbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            outbox_dir: outbox_dir.into(),
        }
    }

    async fn copy_with_progress(from: &Path, to: &Path, progress: &ProgressSink) -> Result<u64> {
        let mut reader = tokio::fs::File::open(from)
            .await
            .map_err(|e| Error::transfer(format!("cannot open {}: {}", from.display(), e)))?;
        let total = reader
            .metadata()
            .await
            .map_err(|e| Error::io_path("reading metadata", from, e))?
            .len();
        let mut writer = tokio::fs::File::create(to)
            .await
            .map_err(|e| Error::io_path("creating file", to, e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;
        progress.report(0, total).await;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| Error::transfer(format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::transfer(format!("write failed: {e}")))?;
            copied += n as u64;
            progress.report(copied, total).await;
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::io_path("flushing file", to, e))?;
        Ok(copied)
    }

    async fn copy_or_discard(from: &Path, to: &Path, progress: &ProgressSink) -> Result<u64> {
        match Self::copy_with_progress(from, to, progress).await {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = remove_if_exists(to).await;
                Err(e)
            }
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string())
}

#[async_trait]
impl TransferClient for LocalTransfer {
    async fn download(&self, source_ref: &str, progress: &ProgressSink) -> Result<PathBuf> {
        ensure_dir_all(&self.work_dir).await?;

        let source = Path::new(source_ref);
        let dest = self.work_dir.join(format!(
            "{}_{}",
            progress.key().job_id,
            file_name_of(source)
        ));

        let bytes = Self::copy_or_discard(source, &dest, progress).await?;
        debug!("Downloaded {} ({} bytes) to {}", source_ref, bytes, dest.display());
        Ok(dest)
    }

    async fn upload(
        &self,
        path: &Path,
        metadata: &UploadMetadata,
        progress: &ProgressSink,
    ) -> Result<String> {
        ensure_dir_all(&self.outbox_dir).await?;

        let dest = self.outbox_dir.join(file_name_of(path));
        let bytes = Self::copy_or_discard(path, &dest, progress).await?;
        debug!(
            job_id = %metadata.job_id,
            "Uploaded {} ({} bytes) to {}",
            path.display(),
            bytes,
            dest.display()
        );
        Ok(dest.to_string_lossy().to_string())
    }
}
