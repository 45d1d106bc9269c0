//! Service container wiring the store, the queue, the worker pool and the
//! registry together, and exposing the operations the messaging layer calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionService, MediaSubmission};
use crate::config::AppConfig;
use crate::database::StoreHealth;
use crate::database::models::QueueEntryDbModel;
use crate::database::repositories::{
    ActiveJobRepository, OwnerRepository, SqlxActiveJobRepository, SqlxConfirmationRepository,
    SqlxOwnerRepository, SqlxQueueRepository,
};
use crate::domain::{Entitlement, Plan, VideoSettings};
use crate::pipeline::status::queue_status;
use crate::pipeline::transfer::LocalTransfer;
use crate::pipeline::{
    CancelAction, FfmpegTranscoder, JobContext, JobNotifier, JobPipeline, JobQueue, JobRegistry,
    QueueStatus, Reconciler, TracingNotifier, TransferClient, WorkerPool,
};
use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// No such running job; it already finished or never existed.
    NotFound,
    /// The requester neither owns the job nor is an administrator.
    Forbidden,
}

/// Holds every service and manages their lifecycle.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub health: StoreHealth,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<JobRegistry>,
    pub admission: Arc<AdmissionService>,
    active_jobs: Arc<dyn ActiveJobRepository>,
    owners: Arc<dyn OwnerRepository>,
    pipeline: JobPipeline,
    worker_pool: WorkerPool,
    reconciler: Arc<Reconciler>,
    reconciler_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Container with local-filesystem transfers and log-only notifications.
    pub fn new(pool: SqlitePool, config: AppConfig) -> Self {
        let transfer = Arc::new(LocalTransfer::new(
            config.pipeline.work_dir.clone(),
            config.outbox_dir.clone(),
        ));
        Self::with_collaborators(pool, config, transfer, Arc::new(TracingNotifier))
    }

    /// Container with caller-supplied transfer and notification collaborators.
    pub fn with_collaborators(
        pool: SqlitePool,
        config: AppConfig,
        transfer: Arc<dyn TransferClient>,
        notifier: Arc<dyn JobNotifier>,
    ) -> Self {
        let health = StoreHealth::new(pool.clone());
        let active_jobs: Arc<dyn ActiveJobRepository> =
            Arc::new(SqlxActiveJobRepository::new(pool.clone()));
        let owners: Arc<dyn OwnerRepository> = Arc::new(SqlxOwnerRepository::new(pool.clone()));
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxQueueRepository::new(pool.clone())),
            health.clone(),
        ));
        let registry = Arc::new(JobRegistry::new());

        let admission = Arc::new(AdmissionService::new(
            Arc::new(SqlxConfirmationRepository::new(pool.clone())),
            owners.clone(),
            queue.clone(),
            health.clone(),
            config.admission.clone(),
        ));

        let transcoder = FfmpegTranscoder::new(
            config.pipeline.ffmpeg_path.clone(),
            config.pipeline.ffprobe_path.clone(),
            config.pipeline.termination_grace,
        );
        let pipeline = JobPipeline::new(Arc::new(JobContext {
            queue: queue.clone(),
            active_jobs: active_jobs.clone(),
            owners: owners.clone(),
            registry: registry.clone(),
            transfer,
            transcoder,
            notifier,
            health: health.clone(),
            config: config.pipeline.clone(),
        }));

        let worker_pool = WorkerPool::new(config.worker_pool.clone(), config.poll_interval);
        let reconciler = Arc::new(Reconciler::new(registry.clone(), config.reconcile_interval));

        Self {
            pool,
            config,
            health,
            queue,
            registry,
            admission,
            active_jobs,
            owners,
            pipeline,
            worker_pool,
            reconciler,
            reconciler_task: parking_lot::Mutex::new(None),
        }
    }

    /// Recover state left by a previous run and start the background tasks.
    ///
    /// Stale active-job rows are dropped; their queue entries are replayed in
    /// submission order, so interrupted jobs restart from the beginning.
    /// Returns the number of recovered queue entries.
    pub async fn initialize(&self) -> Result<usize> {
        ensure_dir_all(&self.config.pipeline.work_dir).await?;

        let stale = self.active_jobs.delete_all().await?;
        if stale > 0 {
            info!("Dropped {} stale active jobs from a previous run", stale);
        }
        self.registry.reset();
        let recovered = self.queue.recover().await?;

        *self.reconciler_task.lock() = Some(self.reconciler.start());
        self.worker_pool
            .start(self.queue.clone(), self.pipeline.clone());

        info!("Services initialized, {} jobs queued", recovered);
        Ok(recovered)
    }

    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await;
    }

    /// Stop the workers, waiting up to `timeout` for running jobs. Jobs still
    /// running afterwards keep their queue entries and resume on next start.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        info!("Shutting down services");
        self.reconciler.stop();
        if tokio::time::timeout(timeout, self.worker_pool.stop())
            .await
            .is_err()
        {
            warn!("Workers did not finish within {:?}", timeout);
        }
        let task = self.reconciler_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Services stopped");
    }

    pub async fn request_confirmation(&self, submission: MediaSubmission) -> Result<String> {
        self.admission.request_confirmation(submission).await
    }

    pub async fn confirm(&self, confirmation_id: &str) -> Result<Admission> {
        self.admission.confirm(confirmation_id).await
    }

    pub async fn reject(&self, confirmation_id: &str) -> Result<()> {
        self.admission.reject(confirmation_id).await
    }

    /// Cancel a running job on behalf of `requester`.
    pub async fn cancel(&self, job_id: &str, requester: i64) -> Result<CancelOutcome> {
        let Some(job) = self
            .health
            .observe(self.active_jobs.get(job_id).await)?
        else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.owner_id != requester && !self.admission.is_admin(requester) {
            return Ok(CancelOutcome::Forbidden);
        }

        let action = self.registry.request_cancel(job_id);
        if action == CancelAction::Finished {
            debug!(job_id, requester, "Cancel: job already finished");
            return Ok(CancelOutcome::NotFound);
        }

        // The job may have finished between the lookup and the request.
        if self.active_jobs.get(job_id).await?.is_none() {
            self.registry.forget_cancel(job_id);
            return Ok(CancelOutcome::NotFound);
        }

        match action {
            CancelAction::Signalled => info!(job_id, requester, "Cancel: transcoder signalled"),
            CancelAction::Withdrawn => info!(job_id, requester, "Cancel: transfer will stop"),
            CancelAction::Flagged => info!(job_id, requester, "Cancel: flagged between stages"),
            CancelAction::Finished => {}
        }
        Ok(CancelOutcome::Cancelled)
    }

    /// Cancel every running job of `owner_id`. Returns how many were cancelled.
    pub async fn cancel_all(&self, owner_id: i64) -> Result<usize> {
        let jobs = self
            .health
            .observe(self.active_jobs.list_for_owner(owner_id).await)?;

        let outcomes = join_all(jobs.iter().map(|job| self.cancel(&job.job_id, owner_id))).await;
        let mut cancelled = 0;
        for outcome in outcomes {
            if outcome? == CancelOutcome::Cancelled {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Running jobs and waiting counts, restricted to `owner` when given.
    pub async fn queue_status(&self, owner: Option<i64>) -> Result<QueueStatus> {
        self.health.observe(
            queue_status(
                self.active_jobs.as_ref(),
                &self.queue,
                &self.registry,
                owner,
            )
            .await,
        )
    }

    /// Waiting entries of `owner_id`, in queue order.
    pub fn list_queue(&self, owner_id: i64) -> Vec<QueueEntryDbModel> {
        self.queue.waiting_for_owner(owner_id)
    }

    pub async fn withdraw(&self, owner_id: i64, position: usize) -> Result<Option<QueueEntryDbModel>> {
        self.queue.withdraw(owner_id, position).await
    }

    pub async fn withdraw_all(&self, owner_id: i64) -> Result<usize> {
        self.queue.withdraw_all(owner_id).await
    }

    /// Administrator operation: drop every waiting entry.
    pub async fn purge_queue(&self) -> Result<usize> {
        self.queue.purge().await
    }

    /// Administrator operation: drop the waiting entry at `position` (1-based).
    pub async fn remove_queue_position(&self, position: usize) -> Result<Option<QueueEntryDbModel>> {
        self.queue.remove_position(position).await
    }

    pub async fn entitlement(&self, owner_id: i64) -> Result<Entitlement> {
        self.admission.entitlement(owner_id).await
    }

    /// Assign (or with `None`, revoke) an owner's plan.
    pub async fn set_plan(
        &self,
        owner_id: i64,
        plan: Option<Plan>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.owners
            .set_plan(
                owner_id,
                plan.as_ref().map(Plan::as_str),
                expires_at.map(|at| at.timestamp_millis()),
            )
            .await
    }

    pub async fn completed_jobs(&self, owner_id: i64) -> Result<i64> {
        Ok(self
            .owners
            .get(owner_id)
            .await?
            .map(|o| o.completed_jobs)
            .unwrap_or(0))
    }

    pub async fn video_settings(&self, owner_id: i64) -> Result<VideoSettings> {
        let owner = self.owners.get(owner_id).await?;
        Ok(VideoSettings::from_stored(
            owner.as_ref().and_then(|o| o.video_settings.as_deref()),
        ))
    }

    /// Merge `key=value` pairs into the owner's settings.
    pub async fn update_video_settings(&self, owner_id: i64, args: &str) -> Result<VideoSettings> {
        let merged = self.video_settings(owner_id).await?.merge_args(args)?;
        self.store_settings(owner_id, &merged).await?;
        Ok(merged)
    }

    /// Apply one choice from each custom picker list.
    pub async fn apply_custom_settings(
        &self,
        owner_id: i64,
        crf: u8,
        fps: u32,
        audio_bitrate: &str,
    ) -> Result<VideoSettings> {
        let updated = self
            .video_settings(owner_id)
            .await?
            .with_custom(crf, fps, audio_bitrate)?;
        self.store_settings(owner_id, &updated).await?;
        Ok(updated)
    }

    pub async fn reset_video_settings(&self, owner_id: i64) -> Result<VideoSettings> {
        self.owners.set_video_settings(owner_id, None).await?;
        Ok(VideoSettings::default())
    }

    async fn store_settings(&self, owner_id: i64, settings: &VideoSettings) -> Result<()> {
        let json = serde_json::to_string(settings).map_err(Error::from)?;
        self.owners.set_video_settings(owner_id, Some(&json)).await
    }

    /// Number of workers currently running a job.
    pub fn active_workers(&self) -> usize {
        self.worker_pool.active_count()
    }
}
