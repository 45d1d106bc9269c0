//! Fixed-size pool of workers pulling jobs from the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::JobPipeline;
use super::job_queue::JobQueue;
use crate::config::WorkerPoolConfig;

/// Runs up to `max_workers` pipelines at once. Each worker runs one job to
/// completion before taking the next.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    poll_interval: Duration,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, poll_interval: Duration) -> Self {
        Self {
            config,
            poll_interval,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, queue: Arc<JobQueue>, pipeline: JobPipeline) {
        info!("Starting worker pool with {} workers", self.config.max_workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped");
            return;
        };

        for worker in 0..self.config.max_workers.max(1) {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let token = self.cancellation_token.clone();
            let active = self.active_workers.clone();
            let poll_interval = self.poll_interval;

            join_set.spawn(async move {
                debug!("Worker {} started", worker);
                worker_loop(worker, queue, pipeline, token, active, poll_interval).await;
                debug!("Worker {} shutting down", worker);
            });
        }
    }

    /// Stop taking new jobs and wait for running ones to finish.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Number of workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<JobQueue>,
    pipeline: JobPipeline,
    token: CancellationToken,
    active: Arc<AtomicUsize>,
    poll_interval: Duration,
) {
    let notifier = queue.notifier();

    loop {
        if token.is_cancelled() {
            break;
        }

        if !queue.health().is_available() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = queue.health().wait_available() => {}
            }
        }

        let Some(entry) = queue.pop() else {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        // The entry may have been withdrawn while it waited.
        match queue.still_queued(&entry.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(entry_id = %entry.id, "Skipping withdrawn entry");
                continue;
            }
            Err(e) => {
                error!(entry_id = %entry.id, "Cannot verify queued entry: {}", e);
                queue.requeue_front(entry);
                continue;
            }
        }

        active.fetch_add(1, Ordering::SeqCst);
        debug!(entry_id = %entry.id, "Worker {} picked up {}", worker, entry.display_name);
        let result = pipeline.run(entry.clone()).await;
        active.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(outcome) => debug!(entry_id = %entry.id, "Worker {} finished: {:?}", worker, outcome),
            Err(e) if e.is_store_unavailable() => {
                warn!(entry_id = %entry.id, "Store unavailable, job returned to queue: {}", e);
                queue.requeue_front(entry);
            }
            Err(e) => {
                error!(entry_id = %entry.id, "Job could not start, dropping entry: {}", e);
                if let Err(e) = queue.remove(&entry.id).await {
                    warn!(entry_id = %entry.id, "Failed to drop entry: {}", e);
                }
            }
        }
    }
}
