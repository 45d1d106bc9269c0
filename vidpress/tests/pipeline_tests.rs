//! End-to-end pipeline runs against fake ffmpeg/ffprobe executables.
#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{TestEnv, grant, install_fake_tools, submit, wait_until};
use sqlx::SqlitePool;
use vidpress::admission::Admission;
use vidpress::database::StoreHealth;
use vidpress::database::models::{ActiveJobDbModel, QueueEntryDbModel};
use vidpress::database::repositories::{
    ActiveJobRepository, SqlxActiveJobRepository, SqlxOwnerRepository, SqlxQueueRepository,
};
use vidpress::domain::Plan;
use vidpress::pipeline::{
    FfmpegTranscoder, JobContext, JobOutcome, JobPipeline, JobQueue, JobRegistry, ProgressSink,
    Stage, TransferClient, UploadMetadata,
};
use vidpress::services::{CancelOutcome, ServiceContainer};
use vidpress::{Error, Result};

const RUN_TIMEOUT: Duration = Duration::from_secs(20);

fn assert_non_decreasing(percents: &[f64]) {
    for pair in percents.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {percents:?}");
    }
}

/// Nothing about any job remains in the store, the registry or the work dir.
async fn assert_no_traces(env: &TestEnv, container: &ServiceContainer, owners: &[i64]) {
    let status = container.queue_status(None).await.unwrap();
    assert!(status.active_jobs.is_empty());
    assert!(status.queued_by_owner.is_empty());
    assert!(container.registry.is_empty());
    assert!(container.registry.snapshots().is_empty());
    for owner in owners {
        assert_eq!(container.queue.count_for_owner(*owner).await.unwrap(), 0);
    }
    assert!(env.work_files().is_empty(), "leftover files: {:?}", env.work_files());
}

#[tokio::test]
async fn test_job_completes_and_leaves_no_traces() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 4, 0.05);
    let container = env.container();
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 300 * 1024);
    let admission = submit(&container, 1, 10, &source).await;
    assert!(matches!(admission, Admission::Accepted(_)));

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    let completed = env.notifier.completed();
    assert_eq!(completed.len(), 1, "events: {:?}", env.notifier.events());
    let job = &completed[0];
    assert_eq!(job.owner_id, 1);
    assert_eq!(job.display_name, "clip.mp4");

    let delivered = PathBuf::from(&job.remote_ref);
    assert!(delivered.exists());
    assert_eq!(
        delivered.file_name().unwrap().to_string_lossy(),
        format!("{}_clip_compressed.mp4", job.job_id)
    );
    assert_eq!(env.outbox_files().len(), 1);

    let transfer_in = env.notifier.percents(&job.job_id, Stage::TransferIn);
    assert_eq!(transfer_in.first().copied(), Some(0.0));
    assert_eq!(transfer_in.last().copied(), Some(100.0));
    assert_non_decreasing(&transfer_in);

    let transcode = env.notifier.percents(&job.job_id, Stage::Transcode);
    assert_eq!(transcode.first().copied(), Some(0.0));
    assert_non_decreasing(&transcode);
    assert!(transcode.last().copied().unwrap_or_default() >= 30.0);

    let transfer_out = env.notifier.percents(&job.job_id, Stage::TransferOut);
    assert_eq!(transfer_out.first().copied(), Some(0.0));
    assert_eq!(transfer_out.last().copied(), Some(100.0));

    assert_eq!(container.completed_jobs(1).await.unwrap(), 1);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_transcode_stops_process() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 9, 0.3);
    let container = env.container();
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 64 * 1024);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || !env.notifier.started().is_empty()).await);
    let job_id = env.notifier.started()[0].clone();
    assert!(
        wait_until(RUN_TIMEOUT, || {
            env.notifier
                .latest_percent(&job_id, Stage::Transcode)
                .is_some_and(|p| p >= 50.0)
        })
        .await
    );

    let output = env
        .config
        .pipeline
        .work_dir
        .join(format!("{job_id}_clip_compressed.mp4"));
    assert!(output.exists());

    let status = container.queue_status(Some(1)).await.unwrap();
    assert_eq!(status.active_jobs.len(), 1);
    assert_eq!(status.active_jobs[0].stage, Some(Stage::Transcode));
    assert!(status.active_jobs[0].percent >= 50.0);

    let requested = Instant::now();
    assert_eq!(
        container.cancel(&job_id, 1).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert!(
        wait_until(Duration::from_secs(5), || env.notifier.cancelled().len() == 1).await
    );
    let grace = env.config.pipeline.termination_grace;
    assert!(requested.elapsed() < grace + Duration::from_secs(1));
    assert!(!output.exists());

    // The notice is sent once and nothing else follows.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.notifier.cancelled(), vec![job_id.clone()]);
    assert!(env.notifier.completed().is_empty());
    assert!(env.notifier.failed().is_empty());

    assert_eq!(
        container.cancel(&job_id, 1).await.unwrap(),
        CancelOutcome::NotFound
    );
    assert!(!container.registry.contains(&job_id));
    assert_eq!(container.completed_jobs(1).await.unwrap(), 0);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_failed_transcode_does_not_block_next_job() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let container = env.container();
    grant(&container, 1, Plan::Pro).await;
    grant(&container, 2, Plan::Pro).await;

    let broken = env.source_file("broken.mp4", 1024);
    let fine = env.source_file("fine.mp4", 1024);
    submit(&container, 1, 10, &broken).await;
    submit(&container, 2, 20, &fine).await;
    container.initialize().await.unwrap();

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 2).await);

    let failed = env.notifier.failed();
    assert_eq!(failed.len(), 1, "events: {:?}", env.notifier.events());
    assert!(failed[0].1.contains("status 1"), "reason: {}", failed[0].1);

    let completed = env.notifier.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].owner_id, 2);

    assert_eq!(container.completed_jobs(1).await.unwrap(), 0);
    assert_eq!(container.completed_jobs(2).await.unwrap(), 1);
    assert_no_traces(&env, &container, &[1, 2]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_single_worker_runs_jobs_one_at_a_time() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 3, 0.1);
    let container = env.container();
    container.initialize().await.unwrap();

    for owner in 1..=3 {
        grant(&container, owner, Plan::Standard).await;
        let source = env.source_file(&format!("v{owner}.mp4"), 2048);
        submit(&container, owner, owner, &source).await;
    }

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 3).await);
    let order: Vec<i64> = env
        .notifier
        .completed()
        .iter()
        .map(|job| job.owner_id)
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert!(!env.path().join("overlap.log").exists());
    assert_eq!(container.active_workers(), 0);
    container.shutdown().await;
}

#[tokio::test]
async fn test_restart_replays_queue_in_submission_order() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);

    let first_run = env.container();
    let mut entries: Vec<QueueEntryDbModel> = Vec::new();
    for owner in 1..=3 {
        grant(&first_run, owner, Plan::Standard).await;
        let source = env.source_file(&format!("j{owner}.mp4"), 1024);
        match submit(&first_run, owner, owner, &source).await {
            Admission::Accepted(entry) => entries.push(entry),
            other => panic!("unexpected admission: {other:?}"),
        }
    }
    // J1 was mid-flight when the process died.
    let active_jobs = SqlxActiveJobRepository::new(env.pool.clone());
    let stale = ActiveJobDbModel::start(&entries[0]);
    active_jobs.insert(&stale).await.unwrap();
    drop(first_run);

    let container = env.container();
    assert_eq!(container.initialize().await.unwrap(), 3);

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 3).await);
    let names: Vec<String> = env
        .notifier
        .completed()
        .into_iter()
        .map(|job| job.display_name)
        .collect();
    assert_eq!(names, vec!["j1.mp4", "j2.mp4", "j3.mp4"]);
    assert!(!env.notifier.started().contains(&stale.job_id));
    assert!(active_jobs.list_all().await.unwrap().is_empty());
    container.shutdown().await;
}

/// Transfer double with configurable pacing and failures.
///
/// Downloads copy the source to `<job_id>_download.mp4` in the work dir
/// before failing, so a failed download leaves a partial file behind.
struct ScriptedTransfer {
    work_dir: PathBuf,
    pool: SqlitePool,
    download_hold: Duration,
    upload_hold: Duration,
    fail_download: bool,
    fail_upload: bool,
    /// Hold the store's write lock this long once the upload has succeeded.
    lock_store_after_upload: Option<Duration>,
    uploaded: AtomicBool,
}

impl ScriptedTransfer {
    fn new(env: &TestEnv) -> Self {
        Self {
            work_dir: env.config.pipeline.work_dir.clone(),
            pool: env.pool.clone(),
            download_hold: Duration::ZERO,
            upload_hold: Duration::ZERO,
            fail_download: false,
            fail_upload: false,
            lock_store_after_upload: None,
            uploaded: AtomicBool::new(false),
        }
    }
}

/// Report ten even steps spread over `hold`.
async fn report_over(progress: &ProgressSink, hold: Duration) {
    let steps = 10u64;
    for step in 0..steps {
        progress.report(step, steps).await;
        tokio::time::sleep(hold / steps as u32).await;
    }
}

#[async_trait]
impl TransferClient for ScriptedTransfer {
    async fn download(&self, source_ref: &str, progress: &ProgressSink) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let dest = self
            .work_dir
            .join(format!("{}_download.mp4", progress.key().job_id));
        tokio::fs::copy(Path::new(source_ref), &dest).await?;

        report_over(progress, self.download_hold).await;
        if self.fail_download {
            return Err(Error::transfer("connection reset by peer"));
        }
        Ok(dest)
    }

    async fn upload(
        &self,
        _path: &Path,
        metadata: &UploadMetadata,
        progress: &ProgressSink,
    ) -> Result<String> {
        report_over(progress, self.upload_hold).await;
        if self.fail_upload {
            return Err(Error::transfer("upload rejected"));
        }

        if let Some(hold) = self.lock_store_after_upload {
            let mut conn = self.pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                sqlx::query("COMMIT").execute(&mut *conn).await.unwrap();
            });
        }
        self.uploaded.store(true, Ordering::SeqCst);
        Ok(format!("remote:{}", metadata.job_id))
    }
}

#[tokio::test]
async fn test_cancel_during_transfer_in() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let transfer = Arc::new(ScriptedTransfer {
        download_hold: Duration::from_secs(2),
        ..ScriptedTransfer::new(&env)
    });
    let container = env.container_with_transfer(transfer.clone());
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 1024);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || !env.notifier.started().is_empty()).await);
    let job_id = env.notifier.started()[0].clone();
    assert!(
        wait_until(RUN_TIMEOUT, || {
            env.notifier
                .latest_percent(&job_id, Stage::TransferIn)
                .is_some_and(|p| p > 0.0)
        })
        .await
    );

    assert_eq!(
        container.cancel(&job_id, 1).await.unwrap(),
        CancelOutcome::Cancelled
    );
    // The download keeps reporting, but nothing reaches the owner any more.
    let reported = env.notifier.percents(&job_id, Stage::TransferIn).len();

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    assert_eq!(env.notifier.cancelled(), vec![job_id.clone()]);
    assert_eq!(env.notifier.percents(&job_id, Stage::TransferIn).len(), reported);
    assert!(env.notifier.percents(&job_id, Stage::Transcode).is_empty());
    assert!(!transfer.uploaded.load(Ordering::SeqCst));
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_all_stops_owner_jobs_only() {
    let mut env = TestEnv::new().await;
    env.config.worker_pool.max_workers = 2;
    install_fake_tools(env.path(), 9, 0.3);
    let container = env.container();
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;
    grant(&container, 2, Plan::Ultra).await;

    let mine = env.source_file("mine.mp4", 1024);
    let theirs = env.source_file("theirs.mp4", 1024);
    submit(&container, 1, 10, &mine).await;
    submit(&container, 2, 20, &theirs).await;

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.started().len() == 2).await);
    assert!(
        wait_until(RUN_TIMEOUT, || {
            env.notifier
                .started()
                .iter()
                .all(|id| env.notifier.latest_percent(id, Stage::Transcode).is_some())
        })
        .await
    );

    assert_eq!(container.cancel_all(1).await.unwrap(), 1);
    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 2).await);
    assert_eq!(env.notifier.cancelled().len(), 1);
    let completed = env.notifier.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].owner_id, 2);
    container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_transfer_out() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let transfer = Arc::new(ScriptedTransfer {
        upload_hold: Duration::from_secs(2),
        ..ScriptedTransfer::new(&env)
    });
    let container = env.container_with_transfer(transfer.clone());
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 1024);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || !env.notifier.started().is_empty()).await);
    let job_id = env.notifier.started()[0].clone();
    assert!(
        wait_until(RUN_TIMEOUT, || {
            env.notifier
                .latest_percent(&job_id, Stage::TransferOut)
                .is_some_and(|p| p > 0.0)
        })
        .await
    );

    assert_eq!(
        container.cancel(&job_id, 1).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let reported = env.notifier.percents(&job_id, Stage::TransferOut).len();

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    assert_eq!(env.notifier.cancelled(), vec![job_id.clone()]);
    assert!(env.notifier.completed().is_empty());
    assert_eq!(env.notifier.percents(&job_id, Stage::TransferOut).len(), reported);
    assert!(transfer.uploaded.load(Ordering::SeqCst));
    assert_eq!(container.completed_jobs(1).await.unwrap(), 0);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_failed_download_leaves_no_traces() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let transfer = Arc::new(ScriptedTransfer {
        fail_download: true,
        ..ScriptedTransfer::new(&env)
    });
    let container = env.container_with_transfer(transfer.clone());
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 4096);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    let failed = env.notifier.failed();
    assert_eq!(failed.len(), 1, "events: {:?}", env.notifier.events());
    assert!(failed[0].1.contains("connection reset"), "reason: {}", failed[0].1);
    assert!(env.notifier.percents(&failed[0].0, Stage::Transcode).is_empty());
    assert!(!transfer.uploaded.load(Ordering::SeqCst));

    assert_eq!(container.completed_jobs(1).await.unwrap(), 0);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_failed_upload_leaves_no_traces() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let transfer = Arc::new(ScriptedTransfer {
        fail_upload: true,
        ..ScriptedTransfer::new(&env)
    });
    let container = env.container_with_transfer(transfer);
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 4096);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    let failed = env.notifier.failed();
    assert_eq!(failed.len(), 1, "events: {:?}", env.notifier.events());
    assert!(failed[0].1.contains("upload rejected"), "reason: {}", failed[0].1);
    assert!(!env.notifier.percents(&failed[0].0, Stage::TransferOut).is_empty());

    assert_eq!(container.completed_jobs(1).await.unwrap(), 0);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_after_delivery_is_refused() {
    let env = TestEnv::new().await;
    install_fake_tools(env.path(), 2, 0.05);
    let transfer = Arc::new(ScriptedTransfer {
        lock_store_after_upload: Some(Duration::from_millis(800)),
        ..ScriptedTransfer::new(&env)
    });
    let container = env.container_with_transfer(transfer.clone());
    container.initialize().await.unwrap();
    grant(&container, 1, Plan::Ultra).await;

    let source = env.source_file("clip.mp4", 1024);
    submit(&container, 1, 10, &source).await;

    assert!(wait_until(RUN_TIMEOUT, || transfer.uploaded.load(Ordering::SeqCst)).await);
    let job_id = env.notifier.started()[0].clone();
    // Cleanup is stalled on the store lock, so the job is still listed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(container.registry.is_finished(&job_id));

    assert_eq!(
        container.cancel(&job_id, 1).await.unwrap(),
        CancelOutcome::NotFound
    );

    assert!(wait_until(RUN_TIMEOUT, || env.notifier.terminal_count() == 1).await);
    assert!(env.notifier.cancelled().is_empty());
    let completed = env.notifier.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].remote_ref, format!("remote:{job_id}"));
    assert_eq!(completed[0].original_bytes, 1024);
    assert!(completed[0].compressed_bytes > 0);
    assert_eq!(container.completed_jobs(1).await.unwrap(), 1);
    assert_no_traces(&env, &container, &[1]).await;
    container.shutdown().await;
}

/// Active-job store whose first deletes fail as if the store were unreachable.
struct FlakyActiveJobs {
    inner: SqlxActiveJobRepository,
    failures_left: AtomicUsize,
    delete_attempts: AtomicUsize,
}

#[async_trait]
impl ActiveJobRepository for FlakyActiveJobs {
    async fn insert(&self, job: &ActiveJobDbModel) -> Result<()> {
        self.inner.insert(job).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<ActiveJobDbModel>> {
        self.inner.get(job_id).await
    }

    async fn list_all(&self) -> Result<Vec<ActiveJobDbModel>> {
        self.inner.list_all().await
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<ActiveJobDbModel>> {
        self.inner.list_for_owner(owner_id).await
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let unreachable = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unreachable {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        self.inner.delete(job_id).await
    }

    async fn delete_all(&self) -> Result<u64> {
        self.inner.delete_all().await
    }
}

#[tokio::test]
async fn test_cleanup_waits_out_unreachable_store() {
    let env = TestEnv::new().await;
    let health = StoreHealth::new(env.pool.clone());
    let queue = Arc::new(JobQueue::new(
        Arc::new(SqlxQueueRepository::new(env.pool.clone())),
        health.clone(),
    ));
    let active_jobs = Arc::new(FlakyActiveJobs {
        inner: SqlxActiveJobRepository::new(env.pool.clone()),
        failures_left: AtomicUsize::new(2),
        delete_attempts: AtomicUsize::new(0),
    });
    let registry = Arc::new(JobRegistry::new());
    let pipeline = JobPipeline::new(Arc::new(JobContext {
        queue: queue.clone(),
        active_jobs: active_jobs.clone(),
        owners: Arc::new(SqlxOwnerRepository::new(env.pool.clone())),
        registry: registry.clone(),
        transfer: Arc::new(ScriptedTransfer {
            fail_download: true,
            ..ScriptedTransfer::new(&env)
        }),
        transcoder: FfmpegTranscoder::new("ffmpeg", "ffprobe", Duration::from_secs(1)),
        notifier: env.notifier.clone(),
        health: health.clone(),
        config: env.config.pipeline.clone(),
    }));

    let source = env.source_file("clip.mp4", 1024);
    let entry = QueueEntryDbModel::new(1, 1, 10, source.to_string_lossy(), "clip.mp4");
    queue.enqueue(entry.clone()).await.unwrap();

    let outcome = tokio::time::timeout(RUN_TIMEOUT, pipeline.run(entry.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));

    assert_eq!(active_jobs.delete_attempts.load(Ordering::SeqCst), 3);
    assert!(active_jobs.list_all().await.unwrap().is_empty());
    assert!(!queue.still_queued(&entry.id).await.unwrap());
    assert!(health.is_available());
    assert!(registry.is_empty());
    assert!(env.work_files().is_empty(), "leftover files: {:?}", env.work_files());
    assert_eq!(env.notifier.failed().len(), 1);
}
