//! Transfer collaborators: fetching sources and delivering results.

mod local;

pub use local::LocalTransfer;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::progress::ProgressSink;
use crate::Result;

/// Extra information sent along with an upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadMetadata {
    pub job_id: String,
    pub owner_id: i64,
    pub chat_ref: i64,
    pub display_name: String,
    /// Duration of the compressed output, when it could be probed.
    pub duration_secs: Option<f64>,
    pub thumbnail: Option<PathBuf>,
}

/// Moves media in and out of the worker's scratch space.
///
/// Both calls report `(current, total)` through the sink; `total` is `0` when
/// unknown. There is no way to abort a call midway: the pipeline checks for
/// cancellation once it returns.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Fetch `source_ref` into local storage and return the local path.
    ///
    /// Files in the work directory named `<job_id>_*` are removed when the
    /// job ends, including partial downloads left behind by a failure.
    async fn download(&self, source_ref: &str, progress: &ProgressSink) -> Result<PathBuf>;

    /// Deliver `path` and return a reference to the delivered copy.
    async fn upload(
        &self,
        path: &Path,
        metadata: &UploadMetadata,
        progress: &ProgressSink,
    ) -> Result<String>;
}
