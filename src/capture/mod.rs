// Screen capture module
// Platform-specific frame sources behind a single CaptureSource contract

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod linux;

pub mod cursor;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Capture not supported on this platform: {0}")]
    PlatformUnsupported(String),
    #[error("Invalid capture operation: {0}")]
    InvalidOperation(String),
    #[error("Capture source has been disposed")]
    Disposed,
    #[error("Failed to initialize capture: {0}")]
    InitError(String),
    #[error("{call} failed with {code:#010x}: {message}")]
    Driver {
        call: &'static str,
        code: u32,
        message: String,
    },
    #[error("Capture permission denied")]
    PermissionDenied,
    #[error("Capture target not found: {0}")]
    TargetNotFound(String),
    #[error("Capture failed: {0}")]
    CaptureError(String),
}

/// Opaque platform window identifier (HWND on Windows, XID on X11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Rectangle in screen pixels, origin at the top-left of the captured monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Right edge, exclusive.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Bottom edge, exclusive.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }
}

/// What a capture source is bound to.
///
/// `Region` is captured as its whole monitor; the recorder crops afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTarget {
    PrimaryMonitor,
    Window(WindowHandle),
    Region(Rect),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra32,
    Rgba32,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => Some(4),
            PixelFormat::Nv12 => None,
        }
    }
}

/// One raw frame, borrowed from the capture source.
///
/// The pixel slice is only valid for the duration of the frame callback that
/// carries it. Anything that must outlive the callback has to be copied out.
#[derive(Debug, Clone, Copy)]
pub struct FrameData<'a> {
    pub data: &'a [u8],
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    /// 100-nanosecond units, monotonically non-decreasing within a session.
    pub timestamp: i64,
    pub format: PixelFormat,
}

impl<'a> FrameData<'a> {
    pub fn new(
        data: &'a [u8],
        stride: usize,
        width: u32,
        height: u32,
        timestamp: i64,
        format: PixelFormat,
    ) -> Self {
        Self {
            data,
            stride,
            width,
            height,
            timestamp,
            format,
        }
    }

    /// Borrow a frame from a raw platform pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `stride * height` bytes for `'a`.
    pub unsafe fn from_raw_parts(
        ptr: *const u8,
        stride: usize,
        width: u32,
        height: u32,
        timestamp: i64,
        format: PixelFormat,
    ) -> Self {
        let len = match format {
            PixelFormat::Nv12 => stride * height as usize * 3 / 2,
            _ => stride * height as usize,
        };
        let data = unsafe { std::slice::from_raw_parts(ptr, len) };
        Self::new(data, stride, width, height, timestamp, format)
    }

    /// Bytes of pixel data in one row, excluding stride padding.
    pub fn row_bytes(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * bpp)
    }

    /// Pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        let row_bytes = self.row_bytes()?;
        let start = y as usize * self.stride;
        self.data.get(start..start + row_bytes)
    }
}

/// Static description of a capture strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub name: &'static str,
    pub hardware_accelerated: bool,
    pub supports_cursor: bool,
    pub per_monitor_dpi: bool,
    pub requires_permission: bool,
}

/// Frame callback. Runs on the capture thread and must not retain the frame.
pub type FrameHandler = Arc<dyn Fn(&FrameData<'_>) + Send + Sync>;

/// A source of raw frames bound to one capture target.
///
/// Instances serve a single session: initialize once, start, stop, dispose.
pub trait CaptureSource: Send + Sync {
    /// Bind to a target. Fails with `InvalidOperation` on a second call.
    fn initialize(&self, target: CaptureTarget, show_cursor: bool) -> Result<(), CaptureError>;

    /// Pacing hint for sources that poll. Call before `start`.
    fn set_target_fps(&self, _fps: u32) {}

    /// Size of the frames this source will deliver, known after `initialize`.
    fn frame_size(&self) -> Option<(u32, u32)>;

    /// Begin producing frames. Idempotent.
    fn start(&self) -> Result<(), CaptureError>;

    /// Halt frame production. Safe when not started, and from the frame callback.
    fn stop(&self) -> Result<(), CaptureError>;

    /// Subscribe (`Some`) or unsubscribe (`None`) the frame callback.
    fn set_frame_handler(&self, handler: Option<FrameHandler>);

    fn capabilities(&self) -> BackendCapabilities;

    /// Release native resources. Safe to call repeatedly.
    fn dispose(&self);
}

/// Create the native capture source for this platform.
pub fn create_capture() -> Result<Box<dyn CaptureSource>, CaptureError> {
    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(windows::DxgiCapture::new()))
    }

    #[cfg(all(target_os = "linux", feature = "x11"))]
    {
        Ok(Box::new(linux::X11Capture::new()))
    }

    #[cfg(all(target_os = "linux", not(feature = "x11")))]
    {
        Err(CaptureError::PlatformUnsupported(
            "built without the 'x11' feature".to_string(),
        ))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Err(CaptureError::PlatformUnsupported(
            std::env::consts::OS.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_slices_skip_padding() {
        // 2x2 BGRA frame with 4 bytes of padding per row
        let data: Vec<u8> = (0..24).collect();
        let frame = FrameData::new(&data, 12, 2, 2, 0, PixelFormat::Bgra32);

        assert_eq!(frame.row_bytes(), Some(8));
        assert_eq!(frame.row(0).unwrap(), &data[0..8]);
        assert_eq!(frame.row(1).unwrap(), &data[12..20]);
        assert!(frame.row(2).is_none());
    }

    #[test]
    fn test_nv12_has_no_packed_rows() {
        let data = vec![0u8; 6];
        let frame = FrameData::new(&data, 2, 2, 2, 0, PixelFormat::Nv12);
        assert!(frame.row_bytes().is_none());
        assert!(frame.row(0).is_none());
    }

    #[test]
    fn test_rect_edges() {
        let rect = Rect::new(-10, 5, 20, 30);
        assert_eq!(rect.right(), 10);
        assert_eq!(rect.bottom(), 35);
        assert!(!rect.is_empty());
        assert!(Rect::new(0, 0, 0, 10).is_empty());
    }
}
