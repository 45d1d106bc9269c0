//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tempfile::TempDir;
use vidpress::admission::{Admission, MediaSubmission};
use vidpress::config::AppConfig;
use vidpress::database;
use vidpress::domain::Plan;
use vidpress::pipeline::{CompletedJob, JobNotifier, ProgressSnapshot, Stage, TransferClient};
use vidpress::services::ServiceContainer;

/// File-backed database: every pooled connection sees the same data.
pub async fn setup_test_db(dir: &Path) -> SqlitePool {
    let url = format!("sqlite:{}?mode=rwc", dir.join("test.db").display());
    let pool = database::init_pool(&url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    pool
}

pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.outbox_dir = dir.join("outbox");
    config.log_dir = dir.join("logs");
    config.reconcile_interval = Duration::from_millis(50);
    config.poll_interval = Duration::from_millis(50);
    config.pipeline.work_dir = dir.join("work");
    config.pipeline.ffmpeg_path = dir.join("bin/ffmpeg").to_string_lossy().to_string();
    config.pipeline.ffprobe_path = dir.join("bin/ffprobe").to_string_lossy().to_string();
    config.pipeline.termination_grace = Duration::from_secs(1);
    config.pipeline.transfer_progress_interval = Duration::ZERO;
    config.pipeline.transcode_progress_interval = Duration::ZERO;
    config
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started(String),
    Progress { job_id: String, stage: Stage, percent: f64 },
    Completed(CompletedJob),
    Cancelled(String),
    Failed(String, String),
}

/// Notifier that remembers every event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Started(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<CompletedJob> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Completed(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Cancelled(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Failed(id, reason) => Some((id, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.completed().len() + self.cancelled().len() + self.failed().len()
    }

    /// Percents reported for `job_id` in `stage`, in order.
    pub fn percents(&self, job_id: &str, stage: Stage) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress {
                    job_id: id,
                    stage: s,
                    percent,
                } if id == job_id && s == stage => Some(percent),
                _ => None,
            })
            .collect()
    }

    /// Latest percent seen for `job_id` in `stage`.
    pub fn latest_percent(&self, job_id: &str, stage: Stage) -> Option<f64> {
        self.percents(job_id, stage).last().copied()
    }
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn job_started(&self, job_id: &str, _owner_id: i64, _display_name: &str) {
        self.events.lock().push(Event::Started(job_id.to_string()));
    }

    async fn progress(&self, _owner_id: i64, snapshot: &ProgressSnapshot) {
        self.events.lock().push(Event::Progress {
            job_id: snapshot.job_id.clone(),
            stage: snapshot.stage,
            percent: snapshot.percent,
        });
    }

    async fn job_completed(&self, job: &CompletedJob) {
        self.events.lock().push(Event::Completed(job.clone()));
    }

    async fn job_cancelled(&self, job_id: &str, _owner_id: i64) {
        self.events.lock().push(Event::Cancelled(job_id.to_string()));
    }

    async fn job_failed(&self, job_id: &str, _owner_id: i64, reason: &str) {
        self.events
            .lock()
            .push(Event::Failed(job_id.to_string(), reason.to_string()));
    }
}

/// A test workspace: temp dir, database, config and recording notifier.
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_test_db(dir.path()).await;
        let config = test_config(dir.path());
        Self {
            dir,
            pool,
            config,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Container using local transfers and the recording notifier.
    pub fn container(&self) -> ServiceContainer {
        let transfer = Arc::new(vidpress::pipeline::LocalTransfer::new(
            self.config.pipeline.work_dir.clone(),
            self.config.outbox_dir.clone(),
        ));
        self.container_with_transfer(transfer)
    }

    pub fn container_with_transfer(&self, transfer: Arc<dyn TransferClient>) -> ServiceContainer {
        ServiceContainer::with_collaborators(
            self.pool.clone(),
            self.config.clone(),
            transfer,
            self.notifier.clone(),
        )
    }

    /// Write a source video of `size` bytes and return its path.
    pub fn source_file(&self, name: &str, size: usize) -> PathBuf {
        let src_dir = self.path().join("sources");
        std::fs::create_dir_all(&src_dir).unwrap();
        let path = src_dir.join(name);
        std::fs::write(&path, vec![7u8; size]).unwrap();
        path
    }

    pub fn work_files(&self) -> Vec<PathBuf> {
        list_files(&self.config.pipeline.work_dir)
    }

    pub fn outbox_files(&self) -> Vec<PathBuf> {
        list_files(&self.config.outbox_dir)
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

pub fn submission(owner_id: i64, message_ref: i64, source: &Path) -> MediaSubmission {
    MediaSubmission {
        owner_id,
        chat_ref: owner_id,
        message_ref,
        source_ref: source.to_string_lossy().to_string(),
        display_name: source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}

/// Give `owner_id` a plan, then run the whole handshake for `source`.
pub async fn submit(
    container: &ServiceContainer,
    owner_id: i64,
    message_ref: i64,
    source: &Path,
) -> Admission {
    let id = container
        .request_confirmation(submission(owner_id, message_ref, source))
        .await
        .unwrap();
    container.confirm(&id).await.unwrap()
}

pub async fn grant(container: &ServiceContainer, owner_id: i64, plan: Plan) {
    container.set_plan(owner_id, Some(plan), None).await.unwrap();
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Install fake `ffmpeg` and `ffprobe` executables under `<dir>/bin`.
///
/// ffprobe always reports a 10 second duration. ffmpeg writes its output
/// file, prints `steps` status lines (`time=00:00:0N.00`, N from 0) spaced by
/// `delay_secs`, and exits 0, or 1 when the input path contains `broken`.
/// Thumbnail invocations (`-vframes`) write the image and exit at once.
/// Overlapping transcodes are recorded in `<dir>/overlap.log`.
#[cfg(unix)]
pub fn install_fake_tools(dir: &Path, steps: u32, delay_secs: f64) {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();

    let ffmpeg = format!(
        r#"#!/bin/sh
prev=""
input=""
last=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then input="$a"; fi
  prev="$a"
  last="$a"
done
case " $* " in
  *" -vframes "*) echo thumb > "$last"; exit 0;;
esac
if ! mkdir "{lock}" 2>/dev/null; then echo overlap >> "{overlap}"; fi
echo partial > "$last"
i=0
while [ $i -lt {steps} ]; do
  printf 'frame=%d fps=25 q=28.0 size=1kB time=00:00:0%d.00 bitrate=1.0kbits/s speed=1x\r' $i $i >&2
  i=$((i+1))
  sleep {delay}
done
rmdir "{lock}" 2>/dev/null
case "$input" in
  *broken*) echo "Conversion failed!" >&2; exit 1;;
esac
exit 0
"#,
        lock = dir.join("ffmpeg.lock").display(),
        overlap = dir.join("overlap.log").display(),
        steps = steps,
        delay = delay_secs,
    );
    let ffprobe = "#!/bin/sh\necho 10.000000\n";

    for (name, body) in [("ffmpeg", ffmpeg.as_str()), ("ffprobe", ffprobe)] {
        let path = bin.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
