// Linux screen capture over X11
// - Root window or a single window via GetImage (Z_PIXMAP, 32 bpp)
// - Cursor composited from XFixes since GetImage never includes it
// - Wayland sessions without XWayland access report PlatformUnsupported

use super::cursor::{draw_cursor, CursorImage};
use super::worker::{CaptureBackend, FrameGrabber, GrabOutcome, ThreadedCaptureSource};
use super::{BackendCapabilities, CaptureError, CaptureTarget, FrameData, PixelFormat};
use x11rb::connection::Connection;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat, Window};
use x11rb::rust_connection::RustConnection;

/// X11 capture source.
pub type X11Capture = ThreadedCaptureSource<X11Backend>;

impl ThreadedCaptureSource<X11Backend> {
    pub fn new() -> Self {
        Self::with_backend(X11Backend)
    }
}

fn x11_err(context: &str, e: impl std::fmt::Display) -> CaptureError {
    CaptureError::CaptureError(format!("{}: {}", context, e))
}

fn connect() -> Result<(RustConnection, usize), CaptureError> {
    if std::env::var_os("DISPLAY").is_none() {
        let reason = if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            "Wayland session without an X11 DISPLAY"
        } else {
            "no DISPLAY set"
        };
        return Err(CaptureError::PlatformUnsupported(reason.to_string()));
    }

    RustConnection::connect(None)
        .map_err(|e| CaptureError::InitError(format!("Failed to connect to X11: {}", e)))
}

/// Resolve the drawable and its size for a target.
fn resolve_target(
    conn: &RustConnection,
    screen_num: usize,
    target: &CaptureTarget,
) -> Result<(Window, u16, u16), CaptureError> {
    let screen = &conn.setup().roots[screen_num];
    match target {
        CaptureTarget::PrimaryMonitor | CaptureTarget::Region(_) => {
            Ok((screen.root, screen.width_in_pixels, screen.height_in_pixels))
        }
        CaptureTarget::Window(handle) => {
            let window = handle.0 as Window;
            let geometry = conn
                .get_geometry(window)
                .map_err(|e| x11_err("get_geometry", e))?
                .reply()
                .map_err(|_| CaptureError::TargetNotFound(format!("X11 window {}", handle)))?;
            Ok((window, geometry.width, geometry.height))
        }
    }
}

pub struct X11Backend;

impl CaptureBackend for X11Backend {
    type Grabber = X11Grabber;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "x11-getimage",
            hardware_accelerated: false,
            supports_cursor: true,
            per_monitor_dpi: false,
            requires_permission: false,
        }
    }

    fn probe(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
        let (conn, screen_num) = connect()?;
        let depth = conn.setup().roots[screen_num].root_depth;
        if depth != 24 && depth != 32 {
            return Err(CaptureError::PlatformUnsupported(format!(
                "X11 root depth {} is not 24/32-bit",
                depth
            )));
        }
        let (_, width, height) = resolve_target(&conn, screen_num, target)?;
        Ok((width as u32, height as u32))
    }

    fn open(&self, target: &CaptureTarget, show_cursor: bool) -> Result<X11Grabber, CaptureError> {
        let (conn, screen_num) = connect()?;
        let (drawable, width, height) = resolve_target(&conn, screen_num, target)?;

        // Cursor overlay needs XFixes 4; capture still works without it
        let cursor_enabled = show_cursor
            && conn
                .xfixes_query_version(4, 0)
                .ok()
                .and_then(|cookie| cookie.reply().ok())
                .is_some();
        if show_cursor && !cursor_enabled {
            log::warn!(target: "screenrec::capture", "XFixes unavailable, recording without cursor");
        }

        let origin = match target {
            CaptureTarget::Window(_) => conn
                .translate_coordinates(drawable, conn.setup().roots[screen_num].root, 0, 0)
                .ok()
                .and_then(|cookie| cookie.reply().ok())
                .map(|r| (r.dst_x as i32, r.dst_y as i32))
                .unwrap_or((0, 0)),
            _ => (0, 0),
        };

        log::info!(
            target: "screenrec::capture",
            "X11 capture opened on drawable {:#x} ({}x{})",
            drawable,
            width,
            height
        );

        Ok(X11Grabber {
            conn,
            drawable,
            width,
            height,
            origin,
            cursor_enabled,
        })
    }
}

pub struct X11Grabber {
    conn: RustConnection,
    drawable: Window,
    width: u16,
    height: u16,
    origin: (i32, i32),
    cursor_enabled: bool,
}

impl X11Grabber {
    fn cursor(&self) -> Option<(CursorImage, i32, i32)> {
        let reply = self.conn.xfixes_get_cursor_image().ok()?.reply().ok()?;
        let image = CursorImage {
            width: reply.width as u32,
            height: reply.height as u32,
            hotspot_x: reply.xhot as i32,
            hotspot_y: reply.yhot as i32,
            pixels: reply.cursor_image,
        };
        Some((
            image,
            reply.x as i32 - self.origin.0,
            reply.y as i32 - self.origin.1,
        ))
    }
}

impl FrameGrabber for X11Grabber {
    fn grab(
        &mut self,
        timestamp: i64,
        deliver: &mut dyn FnMut(&FrameData<'_>),
    ) -> Result<GrabOutcome, CaptureError> {
        let reply = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.drawable,
                0,
                0,
                self.width,
                self.height,
                !0,
            )
            .map_err(|e| x11_err("get_image", e))?
            .reply()
            .map_err(|e| x11_err("get_image reply", e))?;

        let width = self.width as u32;
        let height = self.height as u32;
        let stride = width as usize * 4;
        let mut data = reply.data;
        if data.len() < stride * height as usize {
            return Err(CaptureError::CaptureError(format!(
                "get_image returned {} bytes, expected {}",
                data.len(),
                stride * height as usize
            )));
        }

        if self.cursor_enabled {
            if let Some((cursor, x, y)) = self.cursor() {
                draw_cursor(&mut data, stride, width, height, &cursor, x, y);
            }
        }

        let frame = FrameData::new(&data, stride, width, height, timestamp, PixelFormat::Bgra32);
        deliver(&frame);
        Ok(GrabOutcome::Delivered)
    }
}
