//! Progress snapshots, gauge rendering and notification throttling.
//!
//! Snapshots are ephemeral: the registry keeps the latest one per job and a
//! missing snapshot simply means the job has no live progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::notifier::JobNotifier;
use super::registry::JobRegistry;

/// Pipeline stages that report progress.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TransferIn,
    Transcode,
    TransferOut,
}

impl Stage {
    /// Short label shown next to the gauge.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TransferIn => "Downloading",
            Self::Transcode => "Compressing",
            Self::TransferOut => "Uploading",
        }
    }
}

/// Identifies one progress surface: a job in a given stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    pub job_id: String,
    pub stage: Stage,
}

impl ProgressKey {
    pub fn new(job_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
        }
    }
}

/// Last known progress of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub stage: Stage,
    pub current: u64,
    /// `0` when the total is unknown.
    pub total: u64,
    pub percent: f64,
    pub label: String,
    /// Seconds since the stage started reporting.
    pub elapsed_secs: f64,
    /// Average units per second so far: bytes for transfers, media
    /// milliseconds for transcoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// A fresh snapshot at 0% for `stage`.
    pub fn start(job_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            current: 0,
            total: 0,
            percent: 0.0,
            label: stage.label().to_string(),
            elapsed_secs: 0.0,
            speed_per_sec: None,
            eta_secs: None,
            updated_at: Utc::now(),
        }
    }
}

/// `current / total` as a percentage in `[0, 100]`; `0` when `total` is unknown.
pub fn percent_of(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (current as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Average rate and remaining time after `elapsed`.
///
/// Both are `None` until some progress was made; the ETA also needs a known
/// total.
pub fn throughput(current: u64, total: u64, elapsed: Duration) -> (Option<f64>, Option<f64>) {
    let secs = elapsed.as_secs_f64();
    if current == 0 || secs <= 0.0 {
        return (None, None);
    }
    let speed = current as f64 / secs;
    let eta = (total > 0).then(|| total.saturating_sub(current) as f64 / speed);
    (Some(speed), eta)
}

/// Render a fixed-width block gauge. `percent` is clamped to `[0, 100]`.
pub fn render_gauge(percent: f64, width: usize) -> String {
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((percent / 100.0) * width as f64).floor() as usize;
    let filled = filled.min(width);
    format!("{}{}", "⬢".repeat(filled), "⬡".repeat(width - filled))
}

/// Decides when an outbound progress notification may be sent.
///
/// A notification is allowed on the first report, once `interval` has passed
/// since the last one, or (when a step is set) once the percent moved by at
/// least `step`.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    step: Option<f64>,
    last_at: Option<Instant>,
    last_percent: f64,
}

impl ProgressThrottle {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            step: None,
            last_at: None,
            last_percent: 0.0,
        }
    }

    pub fn every_or_step(interval: Duration, step: f64) -> Self {
        Self {
            step: Some(step),
            ..Self::every(interval)
        }
    }

    pub fn should_emit(&mut self, percent: f64, now: Instant) -> bool {
        let due = match self.last_at {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.interval
                    || self
                        .step
                        .is_some_and(|step| (percent - self.last_percent).abs() >= step)
            }
        };
        if due {
            self.last_at = Some(now);
            self.last_percent = percent;
        }
        due
    }
}

#[derive(Debug)]
struct SinkState {
    throttle: ProgressThrottle,
    high_water: f64,
    started: Instant,
}

/// Progress callback handed to transfer and transcode stages.
///
/// Each report is ignored once the job's cancellation registration is gone.
/// Otherwise the snapshot is overwritten on every report, while the notifier
/// only hears about it when the throttle allows.
pub struct ProgressSink {
    key: ProgressKey,
    owner_id: i64,
    registry: Arc<JobRegistry>,
    notifier: Arc<dyn JobNotifier>,
    state: Mutex<SinkState>,
}

impl ProgressSink {
    pub fn new(
        key: ProgressKey,
        owner_id: i64,
        registry: Arc<JobRegistry>,
        notifier: Arc<dyn JobNotifier>,
        throttle: ProgressThrottle,
    ) -> Self {
        Self {
            key,
            owner_id,
            registry,
            notifier,
            state: Mutex::new(SinkState {
                throttle,
                high_water: 0.0,
                started: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> &ProgressKey {
        &self.key
    }

    /// Report `current` out of `total` units (`total == 0` when unknown).
    pub async fn report(&self, current: u64, total: u64) {
        let (snapshot, emit) = {
            let mut state = self.state.lock();
            state.high_water = state.high_water.max(percent_of(current, total));
            let percent = state.high_water;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.started);
            let (speed_per_sec, eta_secs) = throughput(current, total, elapsed);
            let emit = state.throttle.should_emit(percent, now);
            let snapshot = ProgressSnapshot {
                job_id: self.key.job_id.clone(),
                stage: self.key.stage,
                current,
                total,
                percent,
                label: self.key.stage.label().to_string(),
                elapsed_secs: elapsed.as_secs_f64(),
                speed_per_sec,
                eta_secs,
                updated_at: Utc::now(),
            };
            (snapshot, emit)
        };

        if !self.registry.update_progress_if_registered(snapshot.clone()) {
            return;
        }
        if emit {
            self.notifier.progress(self.owner_id, &snapshot).await;
        }
    }
}
