// Windows screen capture using DXGI Desktop Duplication API
// GPU duplication with a CPU-readable staging texture, Windows 8+

use super::cursor::{draw_cursor, CursorImage};
use super::worker::{CaptureBackend, FrameGrabber, GrabOutcome, ThreadedCaptureSource};
use super::{BackendCapabilities, CaptureError, CaptureTarget, FrameData, PixelFormat};

use windows::{
    core::Interface,
    Win32::Foundation::HMODULE,
    Win32::Graphics::Direct3D::*,
    Win32::Graphics::Direct3D11::*,
    Win32::Graphics::Dxgi::Common::*,
    Win32::Graphics::Dxgi::*,
};

const ACQUIRE_TIMEOUT_MS: u32 = 10;

/// Desktop Duplication capture source.
pub type DxgiCapture = ThreadedCaptureSource<DxgiBackend>;

impl ThreadedCaptureSource<DxgiBackend> {
    pub fn new() -> Self {
        Self::with_backend(DxgiBackend)
    }
}

fn driver(call: &'static str, e: windows::core::Error) -> CaptureError {
    CaptureError::Driver {
        call,
        code: e.code().0 as u32,
        message: e.message().to_string(),
    }
}

/// Find the output whose desktop origin is (0, 0).
fn primary_output() -> Result<(IDXGIAdapter1, IDXGIOutput, DXGI_OUTPUT_DESC), CaptureError> {
    unsafe {
        let factory: IDXGIFactory1 =
            CreateDXGIFactory1().map_err(|e| driver("CreateDXGIFactory1", e))?;

        let mut adapter_idx = 0u32;
        while let Ok(adapter) = factory.EnumAdapters1(adapter_idx) {
            let mut output_idx = 0u32;
            while let Ok(output) = adapter.EnumOutputs(output_idx) {
                let desc = output
                    .GetDesc()
                    .map_err(|e| driver("IDXGIOutput::GetDesc", e))?;
                let rect = desc.DesktopCoordinates;
                if rect.left == 0 && rect.top == 0 {
                    return Ok((adapter, output, desc));
                }
                output_idx += 1;
            }
            adapter_idx += 1;
        }
    }

    Err(CaptureError::TargetNotFound("primary monitor".to_string()))
}

fn output_size(desc: &DXGI_OUTPUT_DESC) -> (u32, u32) {
    let rect = desc.DesktopCoordinates;
    ((rect.right - rect.left) as u32, (rect.bottom - rect.top) as u32)
}

pub struct DxgiBackend;

impl CaptureBackend for DxgiBackend {
    type Grabber = DxgiGrabber;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "dxgi-duplication",
            hardware_accelerated: true,
            supports_cursor: true,
            per_monitor_dpi: true,
            requires_permission: false,
        }
    }

    fn probe(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
        if let CaptureTarget::Window(handle) = target {
            return Err(CaptureError::PlatformUnsupported(format!(
                "Desktop Duplication cannot capture window {}",
                handle
            )));
        }

        let (_, output, desc) = primary_output()?;
        output.cast::<IDXGIOutput1>().map_err(|_| {
            CaptureError::PlatformUnsupported(
                "Desktop Duplication requires Windows 8 or later".to_string(),
            )
        })?;

        Ok(output_size(&desc))
    }

    fn open(&self, _target: &CaptureTarget, show_cursor: bool) -> Result<DxgiGrabber, CaptureError> {
        let (adapter, output, desc) = primary_output()?;
        let (width, height) = output_size(&desc);

        unsafe {
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;

            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE(std::ptr::null_mut()),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| driver("D3D11CreateDevice", e))?;

            let device = device.ok_or_else(|| {
                CaptureError::InitError("D3D11CreateDevice returned null device".to_string())
            })?;
            let context = context.ok_or_else(|| {
                CaptureError::InitError("D3D11CreateDevice returned null context".to_string())
            })?;

            let output1: IDXGIOutput1 = output.cast().map_err(|_| {
                CaptureError::PlatformUnsupported(
                    "Desktop Duplication requires Windows 8 or later".to_string(),
                )
            })?;

            let duplication = output1
                .DuplicateOutput(&device)
                .map_err(|e| driver("IDXGIOutput1::DuplicateOutput", e))?;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: D3D11_BIND_FLAG(0).0 as u32,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: D3D11_RESOURCE_MISC_FLAG(0).0 as u32,
            };

            let mut staging: Option<ID3D11Texture2D> = None;
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| driver("ID3D11Device::CreateTexture2D", e))?;
            let staging = staging.ok_or_else(|| {
                CaptureError::InitError("CreateTexture2D returned null".to_string())
            })?;

            log::info!(target: "screenrec::capture", "DXGI duplication opened ({}x{})", width, height);

            Ok(DxgiGrabber {
                device,
                context,
                output1,
                duplication,
                staging,
                width,
                height,
                show_cursor,
                has_frame: false,
                cursor: None,
                cursor_pos: None,
                scratch: Vec::new(),
            })
        }
    }
}

pub struct DxgiGrabber {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    output1: IDXGIOutput1,
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Texture2D,
    width: u32,
    height: u32,
    show_cursor: bool,
    has_frame: bool,
    cursor: Option<CursorImage>,
    cursor_pos: Option<(i32, i32)>,
    scratch: Vec<u8>,
}

impl DxgiGrabber {
    fn reopen_duplication(&mut self) -> Result<(), CaptureError> {
        log::warn!(target: "screenrec::capture", "DXGI access lost, recreating duplication");
        self.duplication = unsafe {
            self.output1
                .DuplicateOutput(&self.device)
                .map_err(|e| driver("IDXGIOutput1::DuplicateOutput", e))?
        };
        Ok(())
    }

    /// Copy an acquired desktop image into the staging texture and track the pointer.
    fn take_acquired(
        &mut self,
        info: &DXGI_OUTDUPL_FRAME_INFO,
        resource: Option<IDXGIResource>,
    ) -> Result<(), CaptureError> {
        if info.LastMouseUpdateTime != 0 {
            let pos = info.PointerPosition;
            self.cursor_pos = pos
                .Visible
                .as_bool()
                .then_some((pos.Position.x, pos.Position.y));
        }

        if self.show_cursor && info.PointerShapeBufferSize > 0 {
            self.cursor = Some(self.read_pointer_shape(info.PointerShapeBufferSize)?);
        }

        let resource = resource.ok_or_else(|| {
            CaptureError::CaptureError("AcquireNextFrame returned null resource".to_string())
        })?;
        let texture: ID3D11Texture2D = resource
            .cast()
            .map_err(|e| driver("IDXGIResource::QueryInterface", e))?;

        unsafe {
            self.context.CopyResource(&self.staging, &texture);
        }
        self.has_frame = true;
        Ok(())
    }

    fn read_pointer_shape(&self, size: u32) -> Result<CursorImage, CaptureError> {
        let mut buf = vec![0u8; size as usize];
        let mut required = 0u32;
        let mut shape = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();

        unsafe {
            self.duplication
                .GetFramePointerShape(
                    size,
                    buf.as_mut_ptr() as *mut _,
                    &mut required,
                    &mut shape,
                )
                .map_err(|e| driver("GetFramePointerShape", e))?;
        }

        Ok(decode_pointer_shape(&buf, &shape))
    }

    fn deliver_staging(
        &mut self,
        timestamp: i64,
        deliver: &mut dyn FnMut(&FrameData<'_>),
    ) -> Result<(), CaptureError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| driver("ID3D11DeviceContext::Map", e))?;
        }

        let pitch = mapped.RowPitch as usize;
        let row_bytes = self.width as usize * 4;
        let mapped_frame = unsafe {
            FrameData::from_raw_parts(
                mapped.pData as *const u8,
                pitch,
                self.width,
                self.height,
                timestamp,
                PixelFormat::Bgra32,
            )
        };

        match (self.show_cursor, self.cursor.as_ref(), self.cursor_pos) {
            (true, Some(cursor), Some((x, y))) => {
                // Mapped memory is read-only, so the pointer is composited on a copy
                self.scratch.resize(row_bytes * self.height as usize, 0);
                for (row, dst) in self.scratch.chunks_exact_mut(row_bytes).enumerate() {
                    if let Some(src) = mapped_frame.row(row as u32) {
                        dst.copy_from_slice(src);
                    }
                }
                draw_cursor(&mut self.scratch, row_bytes, self.width, self.height, cursor, x, y);
                let frame = FrameData::new(
                    &self.scratch,
                    row_bytes,
                    self.width,
                    self.height,
                    timestamp,
                    PixelFormat::Bgra32,
                );
                deliver(&frame);
            }
            _ => deliver(&mapped_frame),
        }

        unsafe {
            self.context.Unmap(&self.staging, 0);
        }
        Ok(())
    }
}

impl FrameGrabber for DxgiGrabber {
    fn grab(
        &mut self,
        timestamp: i64,
        deliver: &mut dyn FnMut(&FrameData<'_>),
    ) -> Result<GrabOutcome, CaptureError> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        let acquired =
            unsafe { self.duplication.AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut info, &mut resource) };

        match acquired {
            Ok(()) => {
                let taken = self.take_acquired(&info, resource);
                unsafe {
                    let _ = self.duplication.ReleaseFrame();
                }
                taken?;
            }
            // Desktop unchanged: repeat the last image to keep a constant rate
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => {
                if !self.has_frame {
                    return Ok(GrabOutcome::Skipped);
                }
            }
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                self.reopen_duplication()?;
                return Ok(GrabOutcome::Skipped);
            }
            Err(e) => return Err(driver("IDXGIOutputDuplication::AcquireNextFrame", e)),
        }

        self.deliver_staging(timestamp, deliver)?;
        Ok(GrabOutcome::Delivered)
    }
}

/// Convert a DXGI pointer shape into a premultiplied ARGB cursor image.
fn decode_pointer_shape(buf: &[u8], shape: &DXGI_OUTDUPL_POINTER_SHAPE_INFO) -> CursorImage {
    let pitch = shape.Pitch as usize;
    let width = shape.Width;
    let kind = shape.Type;

    let monochrome = kind == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MONOCHROME.0 as u32;
    // monochrome shapes stack the AND mask on top of the XOR mask
    let height = if monochrome { shape.Height / 2 } else { shape.Height };
    let mut pixels = Vec::with_capacity((width * height) as usize);

    for y in 0..height as usize {
        for x in 0..width as usize {
            let argb = if monochrome {
                let bit = 0x80u8 >> (x % 8);
                let and = buf.get(y * pitch + x / 8).is_some_and(|b| b & bit != 0);
                let xor = buf
                    .get((y + height as usize) * pitch + x / 8)
                    .is_some_and(|b| b & bit != 0);
                match (and, xor) {
                    (true, false) => 0,
                    (false, true) => 0xFFFF_FFFF,
                    _ => 0xFF00_0000,
                }
            } else {
                let offset = y * pitch + x * 4;
                let Some(px) = buf.get(offset..offset + 4) else {
                    pixels.push(0);
                    continue;
                };
                let (b, g, r, a) = (px[0] as u32, px[1] as u32, px[2] as u32, px[3] as u32);
                if kind == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR.0 as u32 {
                    // mask byte 0 means opaque color, anything else is an XOR pixel
                    if a == 0 { 0xFF00_0000 | (r << 16) | (g << 8) | b } else { 0 }
                } else {
                    (a << 24) | ((r * a / 255) << 16) | ((g * a / 255) << 8) | (b * a / 255)
                }
            };
            pixels.push(argb);
        }
    }

    CursorImage {
        width,
        height,
        hotspot_x: shape.HotSpot.x,
        hotspot_y: shape.HotSpot.y,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_primary_monitor() {
        // This might fail on CI without a display
        if let Ok((w, h)) = DxgiBackend.probe(&CaptureTarget::PrimaryMonitor) {
            assert!(w > 0 && h > 0);
        }
    }

    #[test]
    fn test_window_target_unsupported() {
        let result = DxgiBackend.probe(&CaptureTarget::Window(crate::capture::WindowHandle(0x10)));
        assert!(matches!(result, Err(CaptureError::PlatformUnsupported(_))));
    }
}
