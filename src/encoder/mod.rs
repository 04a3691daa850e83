// Video encoder module
// Native sink writers where available, pure-Rust MJPEG/AVI otherwise

#[cfg(target_os = "windows")]
pub mod media_foundation;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub mod avi;

use crate::capture::{FrameData, PixelFormat};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// 100ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Error, Debug, Clone)]
pub enum EncoderError {
    #[error("Failed to initialize encoder: {0}")]
    InitError(String),
    #[error("Encoder already initialized")]
    AlreadyInitialized,
    #[error("Encoder not initialized")]
    NotInitialized,
    #[error("Encoder already finalized")]
    Finalized,
    #[error("Encoder has been disposed")]
    Disposed,
    #[error("Encoder not supported on this platform: {0}")]
    PlatformUnsupported(String),
    #[error("Hardware encoder not available")]
    HardwareNotAvailable,
    #[error("{call} failed with {code:#010x}: {message}")]
    Driver {
        call: &'static str,
        code: u32,
        message: String,
    },
    #[error("Unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("Encoding failed: {0}")]
    EncodeError(String),
    #[error("Finalize failed: {0}")]
    FinalizeError(String),
    #[error("Output file missing: {}", .0.display())]
    OutputMissing(PathBuf),
    #[error("Output file is empty: {}", .0.display())]
    OutputEmpty(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for EncoderError {
    fn from(e: std::io::Error) -> Self {
        EncoderError::Io(Arc::new(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        };
        f.write_str(name)
    }
}

impl FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "hevc" | "h265" => Ok(VideoCodec::Hevc),
            "vp9" => Ok(VideoCodec::Vp9),
            "av1" => Ok(VideoCodec::Av1),
            other => Err(format!("unknown codec '{}'", other)),
        }
    }
}

/// Fixed for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second.
    pub bitrate: u32,
    pub codec: VideoCodec,
    /// Reverse row order before encoding.
    #[serde(default)]
    pub flip_vertical: bool,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 4_000_000,
            codec: VideoCodec::H264,
            flip_vertical: false,
        }
    }
}

/// Constant-rate sample timestamps, independent of capture jitter.
#[derive(Debug, Clone)]
pub struct SampleClock {
    duration: i64,
    time: i64,
}

impl SampleClock {
    pub fn new(fps: u32) -> Self {
        let fps = fps.max(1) as i64;
        Self {
            duration: (TICKS_PER_SECOND + fps / 2) / fps,
            time: 0,
        }
    }

    /// Duration of one sample in 100ns units.
    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Time after the last advanced sample.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Start time and duration for the next sample; advances the clock.
    pub fn next_sample(&mut self) -> (i64, i64) {
        let start = self.time;
        self.time += self.duration;
        (start, self.duration)
    }
}

/// Frame sink producing one playable file per session.
pub trait VideoEncoder: Send {
    /// Open the output container. Not callable twice or after `dispose`.
    fn initialize(&mut self, format: &VideoFormat, output: &Path) -> Result<(), EncoderError>;

    /// Submit one frame; advances the sample clock by one frame duration.
    fn write_frame(&mut self, frame: &FrameData<'_>) -> Result<(), EncoderError>;

    /// Flush and close the output. A second call is a no-op.
    fn finalize(&mut self) -> Result<(), EncoderError>;

    /// Release the encoder; finalizes first if still open.
    fn dispose(&mut self);

    /// Current sample time in 100ns units.
    fn sample_time(&self) -> i64;

    fn frames_written(&self) -> u64;

    /// Extension matching the container this encoder writes.
    fn file_extension(&self) -> &'static str;

    fn info(&self) -> &str;
}

/// Encoder state shared by the implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Initialized,
    Finalized,
    Disposed,
}

impl Lifecycle {
    pub(crate) fn check_initialize(self) -> Result<(), EncoderError> {
        match self {
            Lifecycle::Created => Ok(()),
            Lifecycle::Disposed => Err(EncoderError::Disposed),
            _ => Err(EncoderError::AlreadyInitialized),
        }
    }

    pub(crate) fn check_write(self) -> Result<(), EncoderError> {
        match self {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Created => Err(EncoderError::NotInitialized),
            Lifecycle::Finalized => Err(EncoderError::Finalized),
            Lifecycle::Disposed => Err(EncoderError::Disposed),
        }
    }
}

/// Copy `height` rows from `src` to `dst`, last source row first.
pub fn flip_vertical(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    height: usize,
) {
    for row in 0..height {
        let s = (height - 1 - row) * src_stride;
        let d = row * dst_stride;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

/// Reverse the row order of a packed buffer in place.
pub fn flip_vertical_in_place(buf: &mut [u8], stride: usize) {
    if stride == 0 {
        return;
    }
    let rows = buf.len() / stride;
    for top in 0..rows / 2 {
        let bottom = rows - 1 - top;
        let (head, tail) = buf.split_at_mut(bottom * stride);
        head[top * stride..(top + 1) * stride].swap_with_slice(&mut tail[..stride]);
    }
}

/// Produce a tightly packed top-down BGRA buffer of exactly the format size.
///
/// Frames of a different size are placed at the top-left of a black canvas
/// and clipped. RGBA input is swizzled. The flip step runs last.
pub fn frame_to_bgra<'a>(
    frame: &FrameData<'a>,
    format: &VideoFormat,
) -> Result<Cow<'a, [u8]>, EncoderError> {
    let bpp = frame
        .format
        .bytes_per_pixel()
        .ok_or(EncoderError::UnsupportedFormat(frame.format))?;
    let row_bytes = format.width as usize * 4;
    let size = row_bytes * format.height as usize;

    let passthrough = frame.format == PixelFormat::Bgra32
        && frame.width == format.width
        && frame.height == format.height
        && frame.stride == row_bytes
        && !format.flip_vertical
        && frame.data.len() >= size;
    if passthrough {
        return Ok(Cow::Borrowed(&frame.data[..size]));
    }

    let mut out = vec![0u8; size];
    let copy_bytes = format.width.min(frame.width) as usize * bpp;
    for y in 0..format.height.min(frame.height) {
        let Some(src) = frame.row(y) else {
            return Err(EncoderError::EncodeError(format!(
                "frame buffer too short for row {}",
                y
            )));
        };
        let dst = &mut out[y as usize * row_bytes..y as usize * row_bytes + copy_bytes];
        dst.copy_from_slice(&src[..copy_bytes]);
        if frame.format == PixelFormat::Rgba32 {
            for px in dst.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
    }

    if format.flip_vertical {
        flip_vertical_in_place(&mut out, row_bytes);
    }
    Ok(Cow::Owned(out))
}

/// Check that a finalized output exists and is non-empty; returns its size.
pub fn verify_output(path: &Path) -> Result<u64, EncoderError> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::error!(target: "screenrec::encoder", "Output missing: {}", path.display());
            return Err(EncoderError::OutputMissing(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        log::error!(target: "screenrec::encoder", "Output is zero bytes: {}", path.display());
        return Err(EncoderError::OutputEmpty(path.to_path_buf()));
    }
    log::info!(target: "screenrec::encoder", "Output verified: {} ({} bytes)", path.display(), len);
    Ok(len)
}

/// Create the best available encoder for this platform
pub fn create_encoder() -> Result<Box<dyn VideoEncoder>, EncoderError> {
    #[cfg(target_os = "windows")]
    {
        match media_foundation::MediaFoundationEncoder::new() {
            Ok(enc) => {
                log::info!(target: "screenrec::encoder", "Using Media Foundation sink writer");
                return Ok(Box::new(enc));
            }
            Err(e) => log::warn!(target: "screenrec::encoder", "Media Foundation not available: {}", e),
        }
    }

    #[cfg(feature = "ffmpeg")]
    {
        match ffmpeg::FfmpegEncoder::new() {
            Ok(enc) => {
                log::info!(target: "screenrec::encoder", "Using FFmpeg library encoder");
                return Ok(Box::new(enc));
            }
            Err(e) => log::warn!(target: "screenrec::encoder", "FFmpeg encoder not available: {}", e),
        }
    }

    log::info!(target: "screenrec::encoder", "Using MJPEG/AVI software encoder");
    Ok(Box::new(avi::AviMjpegEncoder::new()))
}
