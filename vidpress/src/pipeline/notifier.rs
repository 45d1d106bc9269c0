//! Outbound job notifications.
//!
//! The messaging layer that shows these to owners lives outside this crate;
//! it plugs in by implementing [`JobNotifier`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::progress::{ProgressSnapshot, render_gauge};

/// Width of the gauge rendered in progress notifications.
pub const GAUGE_WIDTH: usize = 10;

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub job_id: String,
    pub owner_id: i64,
    pub display_name: String,
    pub remote_ref: String,
    /// Size of the downloaded source.
    pub original_bytes: u64,
    /// Size of the transcoded output.
    pub compressed_bytes: u64,
    /// Wall time from start to delivery.
    pub elapsed: Duration,
}

impl CompletedJob {
    /// How much smaller the output is, in percent. Negative when it grew.
    pub fn size_reduction_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        (1.0 - self.compressed_bytes as f64 / self.original_bytes as f64) * 100.0
    }
}

/// Receives job lifecycle events. Implementations must not fail the job:
/// delivery problems are theirs to log.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn job_started(&self, job_id: &str, owner_id: i64, display_name: &str);
    async fn progress(&self, owner_id: i64, snapshot: &ProgressSnapshot);
    async fn job_completed(&self, job: &CompletedJob);
    async fn job_cancelled(&self, job_id: &str, owner_id: i64);
    async fn job_failed(&self, job_id: &str, owner_id: i64, reason: &str);
}

/// Notifier that writes events to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl JobNotifier for TracingNotifier {
    async fn job_started(&self, job_id: &str, owner_id: i64, display_name: &str) {
        info!(job_id, owner_id, "Job started: {}", display_name);
    }

    async fn progress(&self, owner_id: i64, snapshot: &ProgressSnapshot) {
        info!(
            job_id = %snapshot.job_id,
            owner_id,
            "{} [{}] {:.1}%",
            snapshot.label,
            render_gauge(snapshot.percent, GAUGE_WIDTH),
            snapshot.percent
        );
    }

    async fn job_completed(&self, job: &CompletedJob) {
        info!(
            job_id = %job.job_id,
            owner_id = job.owner_id,
            "Job completed: {} -> {} ({} -> {} bytes, {:.1}% smaller, {:.1}s)",
            job.display_name,
            job.remote_ref,
            job.original_bytes,
            job.compressed_bytes,
            job.size_reduction_percent(),
            job.elapsed.as_secs_f64()
        );
    }

    async fn job_cancelled(&self, job_id: &str, owner_id: i64) {
        info!(job_id, owner_id, "Job cancelled");
    }

    async fn job_failed(&self, job_id: &str, owner_id: i64, reason: &str) {
        warn!(job_id, owner_id, "Job failed: {}", reason);
    }
}
