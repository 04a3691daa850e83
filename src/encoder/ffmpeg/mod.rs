//! FFmpeg library encoder writing straight to a container file
//!
//! Picks the first available implementation for the requested codec:
//! - NVENC (NVIDIA)
//! - QSV (Intel)
//! - VideoToolbox (macOS)
//! - libx264 / libx265 / libvpx-vp9 / libaom-av1 software fallback
//!
//! The container is chosen by FFmpeg from the output file extension; the
//! default path always ends in `.mp4`, which carries all four codecs.

use crate::capture::FrameData;
use crate::encoder::{frame_to_bgra, EncoderError, Lifecycle, SampleClock, VideoCodec, VideoEncoder, VideoFormat};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::Context;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::{Dictionary, Packet, Rational};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static FFMPEG_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize FFmpeg (call once)
fn init_ffmpeg() -> Result<(), EncoderError> {
    FFMPEG_INIT
        .get_or_init(|| {
            ffmpeg::init().map_err(|e| e.to_string())?;
            if cfg!(debug_assertions) {
                ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
            } else {
                ffmpeg::log::set_level(ffmpeg::log::Level::Error);
            }
            Ok(())
        })
        .clone()
        .map_err(|e| EncoderError::InitError(format!("FFmpeg init failed: {}", e)))
}

fn av_err(context: &str, e: ffmpeg::Error) -> EncoderError {
    EncoderError::EncodeError(format!("{}: {}", context, e))
}

/// Encoder implementations in order of preference
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwEncoderType {
    Nvenc,        // NVIDIA NVENC
    Qsv,          // Intel QuickSync
    VideoToolbox, // Apple VideoToolbox
    Software,     // libx264 and friends
}

impl HwEncoderType {
    /// FFmpeg encoder name for `codec`, if this implementation has one
    fn codec_name(&self, codec: VideoCodec) -> Option<&'static str> {
        use VideoCodec::*;
        match (self, codec) {
            (HwEncoderType::Nvenc, H264) => Some("h264_nvenc"),
            (HwEncoderType::Nvenc, Hevc) => Some("hevc_nvenc"),
            (HwEncoderType::Nvenc, Av1) => Some("av1_nvenc"),
            (HwEncoderType::Qsv, H264) => Some("h264_qsv"),
            (HwEncoderType::Qsv, Hevc) => Some("hevc_qsv"),
            (HwEncoderType::Qsv, Vp9) => Some("vp9_qsv"),
            (HwEncoderType::Qsv, Av1) => Some("av1_qsv"),
            (HwEncoderType::VideoToolbox, H264) => Some("h264_videotoolbox"),
            (HwEncoderType::VideoToolbox, Hevc) => Some("hevc_videotoolbox"),
            (HwEncoderType::Software, H264) => Some("libx264"),
            (HwEncoderType::Software, Hevc) => Some("libx265"),
            (HwEncoderType::Software, Vp9) => Some("libvpx-vp9"),
            (HwEncoderType::Software, Av1) => Some("libaom-av1"),
            _ => None,
        }
    }

    /// Encoder-specific options tuned for screen content
    fn options(&self, codec: VideoCodec) -> Dictionary<'static> {
        let mut opts = Dictionary::new();

        match self {
            HwEncoderType::Nvenc => {
                opts.set("preset", "p4");
                opts.set("rc", "vbr");
            }
            HwEncoderType::Qsv => {
                opts.set("preset", "faster");
            }
            HwEncoderType::VideoToolbox => {
                opts.set("realtime", "1");
            }
            HwEncoderType::Software => match codec {
                VideoCodec::H264 | VideoCodec::Hevc => {
                    opts.set("preset", "ultrafast");
                }
                VideoCodec::Vp9 => {
                    opts.set("deadline", "realtime");
                    opts.set("cpu-used", "8");
                }
                VideoCodec::Av1 => {
                    opts.set("cpu-used", "8");
                    opts.set("usage", "realtime");
                }
            },
        }

        opts
    }

    fn is_hardware(&self) -> bool {
        !matches!(self, HwEncoderType::Software)
    }
}

/// Detect the best available implementation for `codec`
fn detect_best_encoder(codec: VideoCodec) -> Result<(HwEncoderType, &'static str), EncoderError> {
    #[cfg(target_os = "macos")]
    let priority = [HwEncoderType::VideoToolbox, HwEncoderType::Software];

    #[cfg(not(target_os = "macos"))]
    let priority = [HwEncoderType::Nvenc, HwEncoderType::Qsv, HwEncoderType::Software];

    for encoder_type in priority {
        let Some(name) = encoder_type.codec_name(codec) else {
            continue;
        };
        if ffmpeg::encoder::find_by_name(name).is_some() {
            log::info!(target: "screenrec::encoder", "Found encoder: {}", name);
            return Ok((encoder_type, name));
        }
        log::debug!(target: "screenrec::encoder", "Encoder not available: {}", name);
    }

    Err(EncoderError::PlatformUnsupported(format!(
        "no FFmpeg encoder for {}",
        codec
    )))
}

/// Convert packed BGRA to planar YUV420P (BT.601, limited range)
fn bgra_to_yuv420(bgra: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let bgra_stride = w * 4;

    let y_size = w * h;
    let uv_w = w / 2;
    let uv_h = h / 2;
    let uv_size = uv_w * uv_h;
    let mut yuv = vec![0u8; y_size + 2 * uv_size];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        let src_row = y * bgra_stride;
        let dst_row = y * w;
        for x in 0..w {
            let si = src_row + x * 4;
            let b = bgra[si] as i32;
            let g = bgra[si + 1] as i32;
            let r = bgra[si + 2] as i32;
            y_plane[dst_row + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }

    // Chroma from the top-left pixel of each 2x2 block
    for by in 0..uv_h {
        let src_row = (by * 2) * bgra_stride;
        let uv_row = by * uv_w;
        for bx in 0..uv_w {
            let si = src_row + (bx * 2) * 4;
            let b = bgra[si] as i32;
            let g = bgra[si + 1] as i32;
            let r = bgra[si + 2] as i32;
            let ui = uv_row + bx;
            u_plane[ui] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_plane[ui] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }

    yuv
}

/// Copy a packed plane into a frame plane honoring its stride.
fn copy_plane(frame: &mut VideoFrame, plane: usize, src: &[u8], row_bytes: usize, rows: usize) {
    let stride = frame.stride(plane);
    let dst = frame.data_mut(plane);
    for row in 0..rows {
        dst[row * stride..row * stride + row_bytes]
            .copy_from_slice(&src[row * row_bytes..(row + 1) * row_bytes]);
    }
}

struct MuxSession {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
}

impl MuxSession {
    fn drain(&mut self) -> Result<(), EncoderError> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.octx)
                .map_err(|e| av_err("write_interleaved", e))?;
        }
        Ok(())
    }
}

/// FFmpeg library encoder producing a playable file
pub struct FfmpegEncoder {
    state: Lifecycle,
    session: Option<MuxSession>,
    format: Option<VideoFormat>,
    output: Option<PathBuf>,
    encoder_type: Option<HwEncoderType>,
    info: String,
    clock: SampleClock,
    frames: u64,
}

impl FfmpegEncoder {
    pub fn new() -> Result<Self, EncoderError> {
        init_ffmpeg()?;
        Ok(Self {
            state: Lifecycle::Created,
            session: None,
            format: None,
            output: None,
            encoder_type: None,
            info: "FFmpeg (uninitialized)".to_string(),
            clock: SampleClock::new(30),
            frames: 0,
        })
    }

    fn open(format: &VideoFormat, output: &Path) -> Result<(MuxSession, HwEncoderType, &'static str), EncoderError> {
        let (encoder_type, codec_name) = detect_best_encoder(format.codec)?;
        let codec = ffmpeg::encoder::find_by_name(codec_name)
            .ok_or_else(|| EncoderError::InitError(format!("Codec {} not found", codec_name)))?;

        let mut octx = ffmpeg::format::output(&output)
            .map_err(|e| EncoderError::InitError(format!("Failed to open {}: {}", output.display(), e)))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let stream_index = {
            let ost = octx
                .add_stream(codec)
                .map_err(|e| EncoderError::InitError(format!("Failed to add stream: {}", e)))?;
            ost.index()
        };

        let fps = format.fps.max(1) as i32;
        let encoder_time_base = Rational::new(1, fps);
        let mut encoder = Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| EncoderError::InitError(format!("Failed to create encoder context: {}", e)))?;
        encoder.set_width(format.width);
        encoder.set_height(format.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        encoder.set_frame_rate(Some(Rational::new(fps, 1)));
        encoder.set_bit_rate(format.bitrate as usize);
        encoder.set_gop(format.fps.max(1) * 2);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder
            .open_with(encoder_type.options(format.codec))
            .map_err(|e| EncoderError::InitError(format!("Failed to open {}: {}", codec_name, e)))?;

        if let Some(mut ost) = octx.stream_mut(stream_index) {
            ost.set_parameters(&encoder);
        }
        octx.write_header()
            .map_err(|e| EncoderError::InitError(format!("Failed to write header: {}", e)))?;

        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(encoder_time_base);

        Ok((
            MuxSession {
                octx,
                encoder,
                stream_index,
                encoder_time_base,
                stream_time_base,
            },
            encoder_type,
            codec_name,
        ))
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn initialize(&mut self, format: &VideoFormat, output: &Path) -> Result<(), EncoderError> {
        self.state.check_initialize()?;
        if format.width == 0 || format.height == 0 || format.width % 2 != 0 || format.height % 2 != 0 {
            return Err(EncoderError::InitError(format!(
                "YUV420 needs even, non-zero dimensions, got {}x{}",
                format.width, format.height
            )));
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (session, encoder_type, codec_name) = Self::open(format, output)?;
        self.info = format!(
            "FFmpeg {} ({})",
            codec_name,
            if encoder_type.is_hardware() { "Hardware" } else { "Software" }
        );
        self.session = Some(session);
        self.encoder_type = Some(encoder_type);
        self.clock = SampleClock::new(format.fps);
        self.format = Some(format.clone());
        self.output = Some(output.to_path_buf());
        self.state = Lifecycle::Initialized;

        log::info!(
            target: "screenrec::encoder",
            "FFmpeg {} encoder initialized: {}x{} @ {} fps, {} bps -> {}",
            codec_name,
            format.width,
            format.height,
            format.fps,
            format.bitrate,
            output.display()
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameData<'_>) -> Result<(), EncoderError> {
        self.state.check_write()?;
        let (Some(session), Some(format)) = (self.session.as_mut(), self.format.as_ref()) else {
            return Err(EncoderError::NotInitialized);
        };

        let bgra = frame_to_bgra(frame, format)?;
        let yuv = bgra_to_yuv420(&bgra, format.width, format.height);

        let w = format.width as usize;
        let h = format.height as usize;
        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);

        let mut video = VideoFrame::new(Pixel::YUV420P, format.width, format.height);
        copy_plane(&mut video, 0, &yuv[..y_size], w, h);
        copy_plane(&mut video, 1, &yuv[y_size..y_size + uv_size], w / 2, h / 2);
        copy_plane(&mut video, 2, &yuv[y_size + uv_size..], w / 2, h / 2);
        video.set_pts(Some(self.frames as i64));

        session
            .encoder
            .send_frame(&video)
            .map_err(|e| av_err("send_frame", e))?;
        session.drain()?;

        self.clock.next_sample();
        self.frames += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EncoderError> {
        if self.state != Lifecycle::Initialized {
            return Ok(());
        }
        self.state = Lifecycle::Finalized;

        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let flushed = session
            .encoder
            .send_eof()
            .map_err(|e| av_err("send_eof", e))
            .and_then(|_| session.drain());
        let trailer = session
            .octx
            .write_trailer()
            .map_err(|e| EncoderError::FinalizeError(format!("write_trailer: {}", e)));

        log::info!(target: "screenrec::encoder", "FFmpeg encoder finalized with {} frames", self.frames);
        flushed
            .map_err(|e| EncoderError::FinalizeError(e.to_string()))
            .and(trailer)
    }

    fn dispose(&mut self) {
        if let Err(e) = self.finalize() {
            log::warn!(target: "screenrec::encoder", "Finalize during dispose failed: {}", e);
        }
        self.session = None;
        self.state = Lifecycle::Disposed;
    }

    fn sample_time(&self) -> i64 {
        self.clock.time()
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn file_extension(&self) -> &'static str {
        "mp4"
    }

    fn info(&self) -> &str {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn test_bgra_to_yuv420_black_and_white() {
        let black = vec![0u8, 0, 0, 255].repeat(4);
        let yuv = bgra_to_yuv420(&black, 2, 2);
        assert_eq!(yuv.len(), 6);
        assert_eq!(&yuv[..4], &[16, 16, 16, 16]);
        assert_eq!(&yuv[4..], &[128, 128]);

        let white = vec![255u8; 16];
        let yuv = bgra_to_yuv420(&white, 2, 2);
        assert_eq!(yuv[0], 235);
        assert_eq!(yuv[4], 128);
    }

    #[test]
    fn test_every_codec_has_software_encoder() {
        for codec in [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Vp9, VideoCodec::Av1] {
            assert!(HwEncoderType::Software.codec_name(codec).is_some());
        }
        assert!(HwEncoderType::VideoToolbox.codec_name(VideoCodec::Vp9).is_none());
    }

    #[test]
    fn test_encode_to_file() {
        let mut enc = match FfmpegEncoder::new() {
            Ok(enc) => enc,
            Err(e) => {
                println!("FFmpeg unavailable: {}", e);
                return;
            }
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let format = VideoFormat {
            width: 64,
            height: 48,
            ..VideoFormat::default()
        };
        if let Err(e) = enc.initialize(&format, &path) {
            println!("No H.264 encoder: {}", e);
            return;
        }

        let pixels = vec![0x60u8; 64 * 48 * 4];
        for i in 0..15 {
            enc.write_frame(&FrameData::new(&pixels, 256, 64, 48, i, PixelFormat::Bgra32))
                .unwrap();
        }
        enc.finalize().unwrap();
        assert_eq!(enc.frames_written(), 15);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
