//! Per-job state machine: transfer in, transcode, transfer out.
//!
//! A run starts by recording an `ActiveJob` row and ends, whatever the
//! outcome, with [`JobPipeline::cleanup`], which removes every trace of the
//! job from the store, the registry and the work directory.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::job_queue::JobQueue;
use super::notifier::{CompletedJob, JobNotifier};
use super::progress::{ProgressKey, ProgressSink, ProgressSnapshot, ProgressThrottle, Stage};
use super::registry::{CancellationRegistration, JobRegistry, OriginRef};
use super::transcode::{FfmpegTranscoder, ProcessHandle, build_args, output_path_for, parse_elapsed};
use super::transfer::{TransferClient, UploadMetadata};
use crate::Result;
use crate::config::PipelineConfig;
use crate::database::StoreHealth;
use crate::database::models::{ActiveJobDbModel, QueueEntryDbModel};
use crate::database::repositories::{ActiveJobRepository, OwnerRepository};
use crate::domain::VideoSettings;
use crate::utils::fs::{file_size, remove_all_quietly, remove_with_prefix};

/// Lifecycle states of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Created,
    TransferIn,
    Transcoding,
    TransferOut,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Forward moves through the stages, or from any live state to a
    /// terminal one. Terminal states are absorbing.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (Created, TransferIn) | (TransferIn, Transcoding) | (Transcoding, TransferOut) => true,
            (TransferOut, Completed) => true,
            (_, Cancelled | Failed) => true,
            _ => false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        remote_ref: String,
        original_bytes: u64,
        compressed_bytes: u64,
    },
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    fn state(&self) -> JobState {
        match self {
            Self::Completed { .. } => JobState::Completed,
            Self::Cancelled => JobState::Cancelled,
            Self::Failed(_) => JobState::Failed,
        }
    }
}

/// Collaborators shared by every pipeline run.
pub struct JobContext {
    pub queue: Arc<JobQueue>,
    pub active_jobs: Arc<dyn ActiveJobRepository>,
    pub owners: Arc<dyn OwnerRepository>,
    pub registry: Arc<JobRegistry>,
    pub transfer: Arc<dyn TransferClient>,
    pub transcoder: FfmpegTranscoder,
    pub notifier: Arc<dyn JobNotifier>,
    pub health: StoreHealth,
    pub config: PipelineConfig,
}

struct JobRun {
    job: ActiveJobDbModel,
    entry: QueueEntryDbModel,
    state: JobState,
    /// Local files to delete during cleanup.
    artifacts: Vec<PathBuf>,
}

impl JobRun {
    fn advance(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!(
                job_id = %self.job.job_id,
                "Unexpected transition {} -> {}",
                self.state,
                next
            );
        }
        debug!(job_id = %self.job.job_id, "{} -> {}", self.state, next);
        self.state = next;
    }

    fn origin(&self) -> OriginRef {
        OriginRef {
            chat_ref: self.entry.chat_ref,
            message_ref: self.entry.message_ref,
        }
    }
}

/// Runs jobs through the pipeline.
#[derive(Clone)]
pub struct JobPipeline {
    ctx: Arc<JobContext>,
}

impl JobPipeline {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Run `entry` to a terminal outcome.
    ///
    /// Only a failure to record the run in the store is returned as an
    /// error; the entry is untouched in that case and may be retried. Every
    /// other failure becomes [`JobOutcome::Failed`].
    pub async fn run(&self, entry: QueueEntryDbModel) -> Result<JobOutcome> {
        let started = Instant::now();
        let job = ActiveJobDbModel::start(&entry);
        self.ctx
            .health
            .observe(self.ctx.active_jobs.insert(&job).await)?;

        let mut run = JobRun {
            job,
            entry,
            state: JobState::Created,
            artifacts: Vec::new(),
        };
        let job_id = run.job.job_id.clone();
        let owner_id = run.job.owner_id;

        info!(job_id = %job_id, owner_id, "Starting job for {}", run.job.display_name);
        self.ctx
            .registry
            .update_progress(ProgressSnapshot::start(&job_id, Stage::TransferIn));
        self.ctx
            .notifier
            .job_started(&job_id, owner_id, &run.job.display_name)
            .await;

        let outcome = self.drive(&mut run).await;
        run.advance(outcome.state());
        self.cleanup(&run).await;

        match &outcome {
            JobOutcome::Completed {
                remote_ref,
                original_bytes,
                compressed_bytes,
            } => {
                if let Err(e) = self.ctx.owners.increment_completed(owner_id).await {
                    warn!(job_id = %job_id, "Failed to bump completed counter: {}", e);
                }
                info!(job_id = %job_id, "Job completed");
                self.ctx
                    .notifier
                    .job_completed(&CompletedJob {
                        job_id: job_id.clone(),
                        owner_id,
                        display_name: run.job.display_name.clone(),
                        remote_ref: remote_ref.clone(),
                        original_bytes: *original_bytes,
                        compressed_bytes: *compressed_bytes,
                        elapsed: started.elapsed(),
                    })
                    .await;
            }
            JobOutcome::Cancelled => {
                info!(job_id = %job_id, "Job cancelled");
                self.ctx.notifier.job_cancelled(&job_id, owner_id).await;
            }
            JobOutcome::Failed(reason) => {
                warn!(job_id = %job_id, "Job failed: {}", reason);
                self.ctx.notifier.job_failed(&job_id, owner_id, reason).await;
            }
        }

        Ok(outcome)
    }

    async fn drive(&self, run: &mut JobRun) -> JobOutcome {
        let registry = &self.ctx.registry;
        let job_id = run.job.job_id.clone();

        // Transfer in
        run.advance(JobState::TransferIn);
        if !self.register(run, Stage::TransferIn, None) {
            return JobOutcome::Cancelled;
        }
        let sink = self.sink(run, Stage::TransferIn, self.transfer_throttle());
        let downloaded = self
            .ctx
            .transfer
            .download(&run.entry.source_ref, &sink)
            .await;
        let input = match downloaded {
            Ok(path) => {
                run.artifacts.push(path.clone());
                path
            }
            Err(_) if registry.transfer_cancelled(&job_id) => return JobOutcome::Cancelled,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        if registry.transfer_cancelled(&job_id) {
            return JobOutcome::Cancelled;
        }
        let original_bytes = file_size(&input).await.unwrap_or_default();

        // Transcode
        run.advance(JobState::Transcoding);
        registry.update_progress(ProgressSnapshot::start(&job_id, Stage::Transcode));

        let duration = match self.ctx.transcoder.probe_duration(&input).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(job_id = %job_id, "Duration probe failed, progress unknown: {}", e);
                None
            }
        };
        let output = output_path_for(&input);
        run.artifacts.push(output.clone());

        let settings = self.settings_for(run.job.owner_id).await;
        let args = build_args(&input, &output, &settings, &self.ctx.config.watermark);

        if !self.register(run, Stage::Transcode, None) {
            return JobOutcome::Cancelled;
        }
        let mut running = match self.ctx.transcoder.spawn(&args) {
            Ok(running) => running,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let handle = running.handle.clone();
        if !self.register(run, Stage::Transcode, Some(handle.clone())) {
            handle.terminate();
            handle.wait().await;
            return JobOutcome::Cancelled;
        }

        let sink = self.sink(run, Stage::Transcode, self.transcode_throttle());
        let total_ms = duration.map(|d| (d * 1000.0) as u64).unwrap_or(0);
        loop {
            match running.status.next_line().await {
                Ok(Some(line)) => {
                    if let Some(elapsed) = parse_elapsed(&line) {
                        sink.report((elapsed * 1000.0) as u64, total_ms).await;
                    }
                    if registry.cancel_requested(&job_id) {
                        handle.terminate();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = %job_id, "Lost transcoder status stream: {}", e);
                    break;
                }
            }
        }

        let exit = handle.wait().await;
        if registry.cancel_requested(&job_id) || exit.terminated {
            return JobOutcome::Cancelled;
        }
        if !exit.success() {
            return JobOutcome::Failed(match exit.code {
                Some(code) => format!("transcoder exited with status {code}"),
                None => "transcoder was killed".to_string(),
            });
        }

        let compressed_bytes = file_size(&output).await.unwrap_or_default();
        let output_duration = self.ctx.transcoder.probe_duration(&output).await.ok();
        let thumbnail = if self.ctx.config.thumbnails {
            match self
                .ctx
                .transcoder
                .extract_thumbnail(&output, output_duration)
                .await
            {
                Ok(path) => {
                    run.artifacts.push(path.clone());
                    Some(path)
                }
                Err(e) => {
                    debug!(job_id = %job_id, "No thumbnail: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // Transfer out
        run.advance(JobState::TransferOut);
        registry.update_progress(ProgressSnapshot::start(&job_id, Stage::TransferOut));
        if !self.register(run, Stage::TransferOut, None) {
            return JobOutcome::Cancelled;
        }

        let metadata = UploadMetadata {
            job_id: job_id.clone(),
            owner_id: run.job.owner_id,
            chat_ref: run.entry.chat_ref,
            display_name: run.job.display_name.clone(),
            duration_secs: output_duration,
            thumbnail,
        };
        let sink = self.sink(run, Stage::TransferOut, self.transfer_throttle());
        let uploaded = self.ctx.transfer.upload(&output, &metadata, &sink).await;
        let remote_ref = match uploaded {
            Ok(remote_ref) => remote_ref,
            Err(_) if registry.transfer_cancelled(&job_id) => return JobOutcome::Cancelled,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        // Settle the outcome and close the job to cancel requests in one step.
        if registry.finish(&job_id) {
            return JobOutcome::Cancelled;
        }

        JobOutcome::Completed {
            remote_ref,
            original_bytes,
            compressed_bytes,
        }
    }

    /// Remove every trace of the run. Each step tolerates targets that are
    /// already gone, so calling this twice is harmless.
    ///
    /// Store deletes wait out an unavailable store; a surviving queue entry
    /// would replay the job on the next start.
    async fn cleanup(&self, run: &JobRun) {
        let job_id = &run.job.job_id;
        self.ctx.registry.finish(job_id);

        let queue = &self.ctx.queue;
        let entry_id = run.entry.id.as_str();
        if let Err(e) = self
            .until_stored("delete queue entry", move || queue.remove(entry_id))
            .await
        {
            warn!(job_id = %job_id, "Failed to delete queue entry: {}", e);
        }
        let active_jobs = &self.ctx.active_jobs;
        if let Err(e) = self
            .until_stored("delete active job", move || active_jobs.delete(job_id))
            .await
        {
            warn!(job_id = %job_id, "Failed to delete active job: {}", e);
        }
        self.ctx.registry.release(job_id);
        remove_all_quietly(run.artifacts.iter().map(PathBuf::as_path)).await;
        // Partial files a failed transfer never handed back.
        let prefix = format!("{job_id}_");
        if let Err(e) = remove_with_prefix(&self.ctx.config.work_dir, &prefix).await {
            warn!(job_id = %job_id, "Failed to sweep work directory: {}", e);
        }
    }

    /// Run a store operation, waiting for the store and retrying for as long
    /// as it is unavailable. Other errors are returned as is.
    async fn until_stored<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match self.ctx.health.observe(f().await) {
                Err(e) if e.is_store_unavailable() => {
                    warn!("Cannot {} until the store is back: {}", op, e);
                    self.ctx.health.wait_available().await;
                }
                result => return result,
            }
        }
    }

    fn register(&self, run: &JobRun, stage: Stage, handle: Option<ProcessHandle>) -> bool {
        let mut registration =
            CancellationRegistration::new(&run.job.job_id, run.job.owner_id, stage, run.origin());
        if let Some(handle) = handle {
            registration = registration.with_handle(handle);
        }
        self.ctx.registry.register(registration)
    }

    fn sink(&self, run: &JobRun, stage: Stage, throttle: ProgressThrottle) -> ProgressSink {
        ProgressSink::new(
            ProgressKey::new(&run.job.job_id, stage),
            run.job.owner_id,
            self.ctx.registry.clone(),
            self.ctx.notifier.clone(),
            throttle,
        )
    }

    fn transfer_throttle(&self) -> ProgressThrottle {
        ProgressThrottle::every(self.ctx.config.transfer_progress_interval)
    }

    fn transcode_throttle(&self) -> ProgressThrottle {
        ProgressThrottle::every_or_step(
            self.ctx.config.transcode_progress_interval,
            self.ctx.config.progress_percent_step,
        )
    }

    async fn settings_for(&self, owner_id: i64) -> VideoSettings {
        match self.ctx.owners.get(owner_id).await {
            Ok(owner) => VideoSettings::from_stored(
                owner.as_ref().and_then(|o| o.video_settings.as_deref()),
            ),
            Err(e) => {
                warn!(owner_id, "Failed to load video settings, using defaults: {}", e);
                VideoSettings::default()
            }
        }
    }
}
