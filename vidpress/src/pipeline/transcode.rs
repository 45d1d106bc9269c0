//! ffmpeg invocation, status parsing and process supervision.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use process_utils::tokio_command;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::VideoSettings;
use crate::{Error, Result};

static ELAPSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex")
});

/// Longest status record kept; longer runs without a separator are flushed
/// in pieces of this size.
const MAX_RECORD_LEN: usize = 4096;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal or when waiting failed.
    pub code: Option<i32>,
    /// Whether the exit followed a termination request.
    pub terminated: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Cloneable handle to a supervised child process.
///
/// The child itself is owned by a waiter task. [`terminate`](Self::terminate)
/// asks that task to stop the process (graceful signal, then a forced kill
/// after the grace window); the exit is published to every clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    terminate: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or(ProcessExit {
                code: None,
                terminated: false,
            }),
            Err(_) => ProcessExit {
                code: None,
                terminated: self.termination_requested(),
            },
        }
    }
}

/// Hand `child` to a waiter task and return a handle to it.
pub fn supervise(mut child: Child, grace: Duration) -> ProcessHandle {
    let pid = child.id();
    let terminate = CancellationToken::new();
    let (tx, rx) = watch::channel(None);

    let token = terminate.clone();
    tokio::spawn(async move {
        let (status, terminated) = tokio::select! {
            _ = token.cancelled() => {
                debug!("Terminating process {:?}", pid);
                (process_utils::terminate_gracefully(&mut child, grace).await, true)
            }
            status = child.wait() => (status, false),
        };

        let code = match status {
            Ok(status) => {
                if !status.success() && !terminated {
                    warn!("Process {:?} exited with {}", pid, status);
                }
                status.code()
            }
            Err(e) => {
                error!("Error waiting for process {:?}: {}", pid, e);
                None
            }
        };
        let _ = tx.send(Some(ProcessExit { code, terminated }));
    });

    ProcessHandle {
        terminate,
        exit: rx,
    }
}

/// Reads a status stream as records separated by `\n` or `\r`.
///
/// ffmpeg rewrites its progress line with carriage returns, so plain line
/// reading would only see progress once the process ends.
pub struct StatusReader<R> {
    reader: BufReader<R>,
    record: Vec<u8>,
}

impl<R: AsyncRead + Unpin> StatusReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            record: Vec::new(),
        }
    }

    /// Next non-empty record, or `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(self.take_record());
            }

            let room = MAX_RECORD_LEN - self.record.len();
            match buf
                .iter()
                .take(room)
                .position(|b| matches!(b, b'\n' | b'\r'))
            {
                Some(idx) => {
                    self.record.extend_from_slice(&buf[..idx]);
                    self.reader.consume(idx + 1);
                    if let Some(line) = self.take_record() {
                        return Ok(Some(line));
                    }
                }
                None => {
                    let len = buf.len().min(room);
                    self.record.extend_from_slice(&buf[..len]);
                    self.reader.consume(len);
                    if self.record.len() >= MAX_RECORD_LEN
                        && let Some(line) = self.take_record()
                    {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    fn take_record(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.record);
        let line = String::from_utf8_lossy(&bytes).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Extract the elapsed media time (in seconds) from an ffmpeg status line.
///
/// Accepts `time=HH:MM:SS.ms` anywhere in the line.
pub fn parse_elapsed(line: &str) -> Option<f64> {
    let caps = ELAPSED_RE.captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
}

/// Build the ffmpeg argument vector for one compression.
pub fn build_args(
    input: &Path,
    output: &Path,
    settings: &VideoSettings,
    watermark: &str,
) -> Vec<String> {
    let filter = format!(
        "scale={},drawtext=text='{}':x=w-tw-10:y=10:fontsize=20:fontcolor=white",
        settings.resolution.replace('x', ":"),
        escape_drawtext(watermark)
    );

    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-vf".to_string(),
        filter,
        "-crf".to_string(),
        settings.crf.to_string(),
        "-b:a".to_string(),
        settings.audio_bitrate.clone(),
        "-r".to_string(),
        settings.fps.to_string(),
        "-preset".to_string(),
        settings.preset.clone(),
        "-c:v".to_string(),
        settings.codec.clone(),
        output.to_string_lossy().to_string(),
    ]
}

/// Output path for a downloaded source: `<stem>_compressed.mp4` beside it.
pub fn output_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    input.with_file_name(format!("{stem}_compressed.mp4"))
}

/// Thumbnail path for a compressed output: `<stem>_thumb.jpg` beside it.
pub fn thumbnail_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    output.with_file_name(format!("{stem}_thumb.jpg"))
}

/// A launched transcode: its handle and its status stream.
pub struct RunningTranscode {
    pub handle: ProcessHandle,
    pub status: StatusReader<ChildStderr>,
}

/// Runs ffmpeg and ffprobe.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
    grace: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>, grace: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            grace,
        }
    }

    /// Container duration in seconds.
    pub async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = tokio_command(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::io_path("running ffprobe", path, e))?;

        if !output.status.success() {
            return Err(Error::transcode(format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d > 0.0)
            .ok_or_else(|| Error::transcode(format!("unparsable duration '{}'", stdout.trim())))
    }

    /// Launch ffmpeg with `args`, reading its stderr as the status stream.
    pub fn spawn(&self, args: &[String]) -> Result<RunningTranscode> {
        debug!("Running {} {}", self.ffmpeg_path, args.join(" "));

        let mut child = tokio_command(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transcode(format!("failed to spawn {}: {}", self.ffmpeg_path, e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transcode("ffmpeg stderr was not captured"))?;

        Ok(RunningTranscode {
            handle: supervise(child, self.grace),
            status: StatusReader::new(stderr),
        })
    }

    /// Extract a 320px wide still from the middle of `video`.
    pub async fn extract_thumbnail(&self, video: &Path, duration: Option<f64>) -> Result<PathBuf> {
        let thumb = thumbnail_path_for(video);
        let midpoint = format!("{:.2}", duration.map(|d| d / 2.0).unwrap_or(0.0));

        let output = tokio_command(&self.ffmpeg_path)
            .args(["-y", "-ss", midpoint.as_str(), "-i"])
            .arg(video)
            .args(["-vframes", "1", "-vf", "scale=320:-1"])
            .arg(&thumb)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::io_path("running ffmpeg", video, e))?;

        if !output.status.success() || !tokio::fs::try_exists(&thumb).await.unwrap_or(false) {
            return Err(Error::transcode(format!(
                "thumbnail extraction failed with {}",
                output.status
            )));
        }
        Ok(thumb)
    }
}
