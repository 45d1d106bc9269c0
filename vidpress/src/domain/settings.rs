//! Per-owner encoder settings.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// CRF values offered by the custom settings picker.
pub const CUSTOM_CRF_CHOICES: &[u8] = &[25, 28, 30, 32, 35, 38, 40];
/// Frame rates offered by the custom settings picker.
pub const CUSTOM_FPS_CHOICES: &[u32] = &[20, 22, 25, 28, 30, 35];
/// Audio bitrates offered by the custom settings picker.
pub const CUSTOM_AUDIO_CHOICES: &[&str] = &["64k", "70k", "80k", "90k", "128k"];

const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];
const CODECS: &[&str] = &["libx264", "libx265"];
const MAX_FPS: u32 = 120;

static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]{1,4}x[1-9][0-9]{1,4}$").expect("valid regex"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]{0,3}k$").expect("valid regex"));

/// Encoder parameters used to build the transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Target size as `WIDTHxHEIGHT`.
    pub resolution: String,
    pub crf: u8,
    /// Audio bitrate such as `64k`.
    pub audio_bitrate: String,
    pub fps: u32,
    pub preset: String,
    pub codec: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: "854x480".to_string(),
            crf: 28,
            audio_bitrate: "64k".to_string(),
            fps: 22,
            preset: "veryfast".to_string(),
            codec: "libx264".to_string(),
        }
    }
}

impl VideoSettings {
    /// Decode stored settings, falling back to defaults for missing or bad data.
    pub fn from_stored(json: Option<&str>) -> Self {
        json.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if !RESOLUTION_RE.is_match(&self.resolution) {
            return Err(Error::validation(format!(
                "resolution must look like 1280x720, got '{}'",
                self.resolution
            )));
        }
        if self.crf > 51 {
            return Err(Error::validation(format!(
                "crf must be between 0 and 51, got {}",
                self.crf
            )));
        }
        if !BITRATE_RE.is_match(&self.audio_bitrate) {
            return Err(Error::validation(format!(
                "audio bitrate must look like 64k, got '{}'",
                self.audio_bitrate
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(Error::validation(format!(
                "fps must be between 1 and {MAX_FPS}, got {}",
                self.fps
            )));
        }
        if !PRESETS.contains(&self.preset.as_str()) {
            return Err(Error::validation(format!("unknown preset '{}'", self.preset)));
        }
        if !CODECS.contains(&self.codec.as_str()) {
            return Err(Error::validation(format!("unsupported codec '{}'", self.codec)));
        }
        Ok(())
    }

    /// Apply whitespace-separated `key=value` pairs on top of these settings.
    ///
    /// Unknown keys are skipped. At least one recognised key is required and
    /// the merged result must validate.
    pub fn merge_args(&self, args: &str) -> Result<Self> {
        let mut merged = self.clone();
        let mut recognised = 0usize;

        for pair in args.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "resolution" => merged.resolution = value.to_ascii_lowercase(),
                "crf" => {
                    merged.crf = value
                        .parse()
                        .map_err(|_| Error::validation(format!("crf is not a number: '{value}'")))?
                }
                "audio_bitrate" | "audio" => merged.audio_bitrate = value.to_ascii_lowercase(),
                "fps" => {
                    merged.fps = value
                        .parse()
                        .map_err(|_| Error::validation(format!("fps is not a number: '{value}'")))?
                }
                "preset" => merged.preset = value.to_ascii_lowercase(),
                "codec" => merged.codec = value.to_ascii_lowercase(),
                _ => continue,
            }
            recognised += 1;
        }

        if recognised == 0 {
            return Err(Error::validation(
                "no recognised settings; use resolution=, crf=, audio_bitrate=, fps=, preset=, codec=",
            ));
        }

        merged.validate()?;
        Ok(merged)
    }

    /// Apply one choice from each custom picker list.
    pub fn with_custom(&self, crf: u8, fps: u32, audio_bitrate: &str) -> Result<Self> {
        if !CUSTOM_CRF_CHOICES.contains(&crf) {
            return Err(Error::validation(format!("crf {crf} is not an offered choice")));
        }
        if !CUSTOM_FPS_CHOICES.contains(&fps) {
            return Err(Error::validation(format!("fps {fps} is not an offered choice")));
        }
        if !CUSTOM_AUDIO_CHOICES.contains(&audio_bitrate) {
            return Err(Error::validation(format!(
                "audio bitrate {audio_bitrate} is not an offered choice"
            )));
        }

        Ok(Self {
            crf,
            fps,
            audio_bitrate: audio_bitrate.to_string(),
            ..self.clone()
        })
    }
}
