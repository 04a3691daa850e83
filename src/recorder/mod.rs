//! Recording sessions
//!
//! `ScreenRecorder` drives a native capture source into a native encoder.
//! `FfmpegRecordingService` records through an external ffmpeg process.
//! `RecordingManager` sits above both and escalates from the first to the
//! second when the native path cannot start.

pub mod fallback;
pub mod manager;
pub mod orchestrator;
pub mod segments;

use crate::capture::{CaptureError, CaptureTarget, Rect, WindowHandle};
use crate::encoder::{EncoderError, VideoCodec};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub use fallback::{FfmpegArgs, FfmpegLocator, FfmpegRecordingService, Grabber};
pub use manager::{ManagerEvent, RecordingManager, ServiceFactory};
pub use orchestrator::{CaptureFactory, EncoderFactory, ScreenRecorder};
pub use segments::{segment_path, FfmpegConcat, SegmentJoiner};

#[derive(Error, Debug, Clone)]
pub enum RecordingError {
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("Recorder has been disposed")]
    Disposed,
    #[error("No {0} factory configured")]
    MissingFactory(&'static str),
    #[error("Invalid recording options: {0}")]
    InvalidOptions(String),
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("Encoder failed: {0}")]
    Encoder(#[from] EncoderError),
    #[error("Output validation failed: {0}")]
    OutputValidation(#[source] EncoderError),
    #[error("ffmpeg executable not found")]
    FfmpegNotFound,
    #[error("Failed to launch recorder process: {0}")]
    Process(String),
    #[error("Recorder process exited with {code:?}: {stderr}")]
    ProcessExited { code: Option<i32>, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for RecordingError {
    fn from(e: std::io::Error) -> Self {
        RecordingError::Io(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for RecordingError {
    fn from(e: tokio::task::JoinError) -> Self {
        RecordingError::Task(e.to_string())
    }
}

impl RecordingError {
    /// Whether retrying through the ffmpeg process can help.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            RecordingError::Capture(CaptureError::PlatformUnsupported(_))
                | RecordingError::Capture(CaptureError::Driver { .. })
                | RecordingError::Encoder(EncoderError::PlatformUnsupported(_))
                | RecordingError::Encoder(EncoderError::Driver { .. })
                | RecordingError::Encoder(EncoderError::HardwareNotAvailable)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Screen,
    Window,
    Region,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenRecordingSettings {
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: VideoCodec,
    pub show_cursor: bool,
    /// Skip the native pipeline and record through ffmpeg.
    pub force_ffmpeg: bool,
    pub flip_vertical: bool,
}

impl Default for ScreenRecordingSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            bitrate_kbps: 4000,
            codec: VideoCodec::H264,
            show_cursor: true,
            force_ffmpeg: false,
            flip_vertical: false,
        }
    }
}

/// Immutable for the duration of one session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordingOptions {
    pub mode: CaptureMode,
    pub window: Option<WindowHandle>,
    pub region: Option<Rect>,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub settings: ScreenRecordingSettings,
}

impl RecordingOptions {
    pub fn screen() -> Self {
        Self::default()
    }

    pub fn window(handle: WindowHandle) -> Self {
        Self {
            mode: CaptureMode::Window,
            window: Some(handle),
            ..Self::default()
        }
    }

    pub fn region(region: Rect) -> Self {
        Self {
            mode: CaptureMode::Region,
            region: Some(region),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_settings(mut self, settings: ScreenRecordingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn validate(&self) -> Result<(), RecordingError> {
        let invalid = |msg: &str| Err(RecordingError::InvalidOptions(msg.to_string()));
        match self.mode {
            CaptureMode::Window if self.window.is_none() => return invalid("window mode needs a window handle"),
            CaptureMode::Region => match self.region {
                None => return invalid("region mode needs a region"),
                Some(r) if r.is_empty() => return invalid("region is empty"),
                Some(r) if r.x < 0 || r.y < 0 => return invalid("region origin is negative"),
                _ => {}
            },
            _ => {}
        }
        if self.settings.fps == 0 || self.settings.fps > 240 {
            return invalid("fps must be between 1 and 240");
        }
        if self.settings.bitrate_kbps == 0 {
            return invalid("bitrate must be positive");
        }
        Ok(())
    }

    /// The capture target matching this mode. Call after `validate`.
    pub fn capture_target(&self) -> CaptureTarget {
        match (self.mode, self.window, self.region) {
            (CaptureMode::Window, Some(handle), _) => CaptureTarget::Window(handle),
            (CaptureMode::Region, _, Some(region)) => CaptureTarget::Region(region),
            _ => CaptureTarget::PrimaryMonitor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordingStatus {
    Idle,
    Initializing,
    Recording,
    Finalizing,
    Error,
    /// Between segments of a paused recording. Only the manager reports it.
    Paused,
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::Initializing => "initializing",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Finalizing => "finalizing",
            RecordingStatus::Error => "error",
            RecordingStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum RecordingEvent {
    StatusChanged {
        status: RecordingStatus,
        elapsed: Duration,
    },
    ErrorOccurred {
        error: Arc<RecordingError>,
        is_fatal: bool,
    },
}

/// One recording backend: native pipeline or external process.
#[async_trait]
pub trait RecordingService: Send + Sync {
    /// Start a session. Initialization errors are returned after the
    /// status has moved through Error and an ErrorOccurred was emitted.
    async fn start_recording(&self, options: RecordingOptions) -> Result<(), RecordingError>;

    /// Stop and finalize. No-op unless recording; the status is Idle afterwards.
    async fn stop_recording(&self) -> Result<(), RecordingError>;

    fn status(&self) -> RecordingStatus;

    fn subscribe(&self) -> broadcast::Receiver<RecordingEvent>;

    /// Output of the current or last session.
    fn output_path(&self) -> Option<PathBuf>;

    /// Release everything; safe to call repeatedly.
    fn dispose(&self);
}

pub(crate) const EVENT_CAPACITY: usize = 64;

/// `<base>/<app>/Screenshots/<yyyy-MM>/<yyyy-MM-dd_HH-mm-ss>.<ext>`
pub fn output_path_for(base: &Path, app_name: &str, now: DateTime<Local>, extension: &str) -> PathBuf {
    base.join(app_name)
        .join("Screenshots")
        .join(now.format("%Y-%m").to_string())
        .join(format!("{}.{}", now.format("%Y-%m-%d_%H-%M-%S"), extension))
}

/// Default output path under the user's documents folder; creates the directories.
pub fn default_output_path(app_name: &str, extension: &str) -> Result<PathBuf, RecordingError> {
    let base = dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let path = output_path_for(&base, app_name, Local::now(), extension);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

/// Use the requested path or derive the default one; the parent directory exists afterwards.
pub(crate) fn resolve_output_path(
    options: &RecordingOptions,
    app_name: &str,
    extension: &str,
) -> Result<PathBuf, RecordingError> {
    match &options.output_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(path.clone())
        }
        None => default_output_path(app_name, extension),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_output_path_layout() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let path = output_path_for(Path::new("/docs"), "ScreenRec", now, "mp4");
        assert_eq!(
            path,
            Path::new("/docs/ScreenRec/Screenshots/2024-03/2024-03-07_09-05-02.mp4")
        );
    }

    #[test]
    fn test_resolve_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/out.avi");
        let options = RecordingOptions::screen().with_output(&target);
        assert_eq!(resolve_output_path(&options, "x", "avi").unwrap(), target);
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn test_validate_options() {
        assert!(RecordingOptions::screen().validate().is_ok());
        assert!(RecordingOptions::region(Rect::new(0, 0, 10, 10)).validate().is_ok());

        let missing_window = RecordingOptions {
            mode: CaptureMode::Window,
            ..RecordingOptions::default()
        };
        assert!(matches!(missing_window.validate(), Err(RecordingError::InvalidOptions(_))));
        assert!(RecordingOptions::region(Rect::new(0, 0, 0, 10)).validate().is_err());

        let mut zero_fps = RecordingOptions::screen();
        zero_fps.settings.fps = 0;
        assert!(zero_fps.validate().is_err());
    }

    #[test]
    fn test_capture_target_follows_mode() {
        let rect = Rect::new(1, 2, 3, 4);
        assert_eq!(RecordingOptions::region(rect).capture_target(), CaptureTarget::Region(rect));
        assert_eq!(
            RecordingOptions::window(WindowHandle(7)).capture_target(),
            CaptureTarget::Window(WindowHandle(7))
        );
        assert_eq!(RecordingOptions::screen().capture_target(), CaptureTarget::PrimaryMonitor);
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(RecordingError::Capture(CaptureError::PlatformUnsupported("x".into())).is_fallback_eligible());
        assert!(RecordingError::Encoder(EncoderError::Driver {
            call: "MFStartup",
            code: 0x8000_4005,
            message: "fail".into(),
        })
        .is_fallback_eligible());
        assert!(!RecordingError::Capture(CaptureError::TargetNotFound("w".into())).is_fallback_eligible());
        assert!(!RecordingError::AlreadyRecording.is_fallback_eligible());
    }

    #[test]
    fn test_settings_defaults_from_partial_json() {
        let settings: ScreenRecordingSettings = serde_json::from_str(r#"{"fps": 60}"#).unwrap();
        assert_eq!(settings.fps, 60);
        assert_eq!(settings.bitrate_kbps, 4000);
        assert!(settings.show_cursor);
    }
}
