// ScreenRec - Screen recording pipeline
// Native capture and encoding with an ffmpeg process fallback

pub mod capture;
pub mod config;
pub mod crop;
pub mod encoder;
pub mod recorder;

pub use capture::{CaptureError, CaptureSource, CaptureTarget, FrameData, PixelFormat, Rect, WindowHandle};
pub use config::{ConfigError, RecorderConfig};
pub use encoder::{EncoderError, VideoCodec, VideoEncoder, VideoFormat};
pub use recorder::{
    CaptureMode, RecordingError, RecordingEvent, RecordingManager, RecordingOptions, RecordingService,
    RecordingStatus, ScreenRecorder, ScreenRecordingSettings,
};
