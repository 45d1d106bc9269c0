//! Process configuration loaded from `VIDPRESS_*` environment variables.
//!
//! A `.env` file in the working directory is honoured (via `dotenvy`) before
//! the environment is read.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ENV_PREFIX: &str = "VIDPRESS_";

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of pipelines allowed to run at once.
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Settings consumed by each job pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub work_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Text drawn in the top-right corner of every output.
    pub watermark: String,
    /// How long a terminated transcoder may take to exit before it is killed.
    #[serde(with = "duration_ms")]
    pub termination_grace: Duration,
    /// Minimum spacing between transfer progress notifications.
    #[serde(with = "duration_ms")]
    pub transfer_progress_interval: Duration,
    /// Minimum spacing between transcode progress notifications when the
    /// percent moved by less than `progress_percent_step`.
    #[serde(with = "duration_ms")]
    pub transcode_progress_interval: Duration,
    pub progress_percent_step: f64,
    pub thumbnails: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            watermark: default_watermark(),
            termination_grace: Duration::from_millis(1000),
            transfer_progress_interval: Duration::from_secs(5),
            transcode_progress_interval: Duration::from_secs(5),
            progress_percent_step: 5.0,
            thumbnails: true,
        }
    }
}

fn default_watermark() -> String {
    "vidpress".to_string()
}

/// Admission handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(with = "duration_ms")]
    pub confirmation_ttl: Duration,
    /// Owner ids with administrator rights.
    pub admin_ids: HashSet<i64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl: Duration::from_secs(600),
            admin_ids: HashSet::new(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub outbox_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Interval of the registry reconciler sweep.
    #[serde(with = "duration_ms")]
    pub reconcile_interval: Duration,
    /// Idle wake-up interval of the worker loop.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub worker_pool: WorkerPoolConfig,
    pub pipeline: PipelineConfig,
    pub admission: AdmissionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:vidpress.db?mode=rwc".to_string(),
            outbox_dir: PathBuf::from("outbox"),
            log_dir: PathBuf::from("logs"),
            reconcile_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
            worker_pool: WorkerPoolConfig::default(),
            pipeline: PipelineConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Keys are passed
    /// with the `VIDPRESS_` prefix applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("OUTBOX_DIR") {
            config.outbox_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("RECONCILE_INTERVAL_MS") {
            config.reconcile_interval = parse_millis("RECONCILE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis("POLL_INTERVAL_MS", &v)?;
        }

        if let Some(v) = get("MAX_WORKERS") {
            let workers: usize = parse_value("MAX_WORKERS", &v)?;
            if workers == 0 {
                return Err(Error::config("VIDPRESS_MAX_WORKERS must be at least 1"));
            }
            config.worker_pool.max_workers = workers;
        }

        let pipeline = &mut config.pipeline;
        if let Some(v) = get("WORK_DIR") {
            pipeline.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FFMPEG_PATH") {
            pipeline.ffmpeg_path = v;
        }
        if let Some(v) = get("FFPROBE_PATH") {
            pipeline.ffprobe_path = v;
        }
        if let Some(v) = get("WATERMARK") {
            pipeline.watermark = v;
        }
        if let Some(v) = get("TERMINATION_GRACE_MS") {
            pipeline.termination_grace = parse_millis("TERMINATION_GRACE_MS", &v)?;
        }
        if let Some(v) = get("THUMBNAILS") {
            pipeline.thumbnails = parse_bool("THUMBNAILS", &v)?;
        }

        if let Some(v) = get("CONFIRMATION_TTL_SECS") {
            let secs: u64 = parse_value("CONFIRMATION_TTL_SECS", &v)?;
            config.admission.confirmation_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = get("ADMIN_IDS") {
            config.admission.admin_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_value("ADMIN_IDS", s))
                .collect::<Result<_>>()?;
        }

        Ok(config)
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {ENV_PREFIX}{name}: '{value}'")))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    parse_value(name, value).map(Duration::from_millis)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid value for {ENV_PREFIX}{name}: '{value}'"
        ))),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
