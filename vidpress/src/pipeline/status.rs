//! Point-in-time view of running and waiting jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::job_queue::JobQueue;
use super::notifier::GAUGE_WIDTH;
use super::progress::{Stage, render_gauge};
use super::registry::JobRegistry;
use crate::Result;
use crate::database::repositories::ActiveJobRepository;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveJobStatus {
    pub job_id: String,
    pub owner_id: i64,
    pub display_name: String,
    /// `None` until the job reports its first progress.
    pub stage: Option<Stage>,
    pub percent: f64,
    pub gauge: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerQueueCount {
    pub owner_id: i64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active_jobs: Vec<ActiveJobStatus>,
    /// Jobs not yet started, per owner.
    pub queued_by_owner: Vec<OwnerQueueCount>,
}

/// Build the status view, restricted to `owner` when given.
pub async fn queue_status(
    active_jobs: &dyn ActiveJobRepository,
    queue: &JobQueue,
    registry: &JobRegistry,
    owner: Option<i64>,
) -> Result<QueueStatus> {
    let jobs = match owner {
        Some(owner_id) => active_jobs.list_for_owner(owner_id).await?,
        None => active_jobs.list_all().await?,
    };

    let active_jobs = jobs
        .into_iter()
        .map(|job| {
            let snapshot = registry.snapshot(&job.job_id);
            let percent = snapshot.as_ref().map(|s| s.percent).unwrap_or(0.0);
            ActiveJobStatus {
                stage: snapshot.map(|s| s.stage),
                percent,
                gauge: render_gauge(percent, GAUGE_WIDTH),
                job_id: job.job_id,
                owner_id: job.owner_id,
                display_name: job.display_name,
            }
        })
        .collect();

    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for entry in queue.waiting() {
        if owner.is_none_or(|o| o == entry.owner_id) {
            *counts.entry(entry.owner_id).or_default() += 1;
        }
    }
    let queued_by_owner = counts
        .into_iter()
        .map(|(owner_id, count)| OwnerQueueCount { owner_id, count })
        .collect();

    Ok(QueueStatus {
        active_jobs,
        queued_by_owner,
    })
}
