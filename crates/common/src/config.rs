//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory where finished recordings are written.
    pub output_dir: PathBuf,

    /// Maximum number of pipelines allowed to capture at the same time.
    pub max_concurrent: usize,

    /// Capture and encoding defaults.
    pub capture: CaptureDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Container/codec pairs the encoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// H.264 in MP4, the widely compatible default.
    Mp4,
    /// VP9 in WebM.
    Webm,
}

impl OutputFormat {
    /// File extension for the container.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }
}

/// How captured frames are paced on their way to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Forward every frame as it arrives; the encoder rebuilds constant
    /// frame timing from wall-clock arrival.
    PassThrough,
    /// Forward a frame only once a full target interval has elapsed since
    /// the previous forward; the encoder assumes a fixed nominal rate.
    Throttle,
}

/// Default capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureDefaults {
    /// Output frame rate.
    pub fps: u32,

    /// JPEG quality requested from the screencast (0-100).
    pub jpeg_quality: u8,

    /// Ask the browser for every Nth rendered frame.
    pub every_nth_frame: u32,

    /// Constant rate factor handed to the encoder.
    pub crf: u32,

    /// Encoder speed preset (H.264 only).
    pub preset: String,

    /// Output container/codec.
    pub format: OutputFormat,

    /// Frame pacing strategy.
    pub pacing: PacingMode,

    /// How long to wait for the page load event before recording anyway.
    pub navigation_timeout_ms: u64,

    /// Fixed delay after navigation so the page can settle before capture.
    pub settle_delay_ms: u64,

    /// How long to wait for the browser's DevTools endpoint.
    pub launch_timeout_ms: u64,

    /// How long the encoder may take to drain and exit after input ends.
    pub drain_timeout_ms: u64,

    /// Capacity of the bounded channel between browser and encoder.
    pub frame_buffer: usize,

    /// Shorten CSS animations and transitions for temporally stable frames.
    pub suppress_motion: bool,

    /// Pass the requested duration to the encoder as a hard cap.
    pub cap_duration: bool,

    /// Explicit browser binary. Falls back to discovery when unset.
    pub browser_path: Option<PathBuf>,

    /// Encoder binary.
    pub ffmpeg_path: PathBuf,

    /// Additional command-line switches for the browser.
    pub extra_browser_args: Vec<String>,

    /// Let the encoder log at info level instead of error.
    pub verbose_encoder: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "siterec=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./recordings"),
            max_concurrent: 3,
            capture: CaptureDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            fps: 25,
            jpeg_quality: 60,
            every_nth_frame: 1,
            crf: 23,
            preset: "veryfast".to_string(),
            format: OutputFormat::Mp4,
            pacing: PacingMode::PassThrough,
            navigation_timeout_ms: 30_000,
            settle_delay_ms: 3_000,
            launch_timeout_ms: 20_000,
            drain_timeout_ms: 30_000,
            frame_buffer: 8,
            suppress_motion: true,
            cap_duration: false,
            browser_path: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            extra_browser_args: Vec::new(),
            verbose_encoder: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("siterec").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"max_concurrent": 5, "capture": {"pacing": "throttle"}}"#)
                .unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.capture.pacing, PacingMode::Throttle);
        assert_eq!(config.capture.fps, 25);
        assert_eq!(config.capture.format, OutputFormat::Mp4);
        assert_eq!(config.output_dir, PathBuf::from("./recordings"));
    }

    #[test]
    fn output_format_extension() {
        assert_eq!(OutputFormat::Mp4.extension(), "mp4");
        assert_eq!(OutputFormat::Webm.extension(), "webm");
    }
}
