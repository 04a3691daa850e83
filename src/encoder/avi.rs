//! MJPEG in an AVI 1.0 (RIFF) container.
//!
//! Pure Rust and available everywhere; used when no native sink writer is
//! present. Every frame is a JPEG keyframe, so the requested codec only
//! affects logging. The output is capped by the 32-bit RIFF sizes at
//! 4 GiB; a frame that would cross it is rejected. Layout:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl' { avih, LIST 'strl' { strh, strf } }
//!   LIST 'movi' { '00dc' jpeg ... }
//!   idx1
//! ```

use super::{frame_to_bgra, EncoderError, Lifecycle, SampleClock, VideoCodec, VideoEncoder, VideoFormat};
use crate::capture::FrameData;
use byteorder::{LittleEndian, WriteBytesExt};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const FRAME_CHUNK: [u8; 4] = *b"00dc";
const IDX1_ENTRY_SIZE: u64 = 16;

/// RIFF sizes and idx1 offsets are 32-bit; anything larger is an error.
fn riff_u32(value: u64, field: &str) -> Result<u32, EncoderError> {
    u32::try_from(value).map_err(|_| {
        EncoderError::FinalizeError(format!("AVI {} {} exceeds the 4 GiB RIFF limit", field, value))
    })
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset_from_movi: u32,
    length: u32,
}

/// Offsets of header fields patched at finalize.
#[derive(Debug, Clone, Copy)]
struct HeaderSlots {
    riff_size: u64,
    total_frames: u64,
    stream_length: u64,
    suggested_buffer: u64,
    movi_size: u64,
}

pub struct AviMjpegEncoder {
    state: Lifecycle,
    format: Option<VideoFormat>,
    output: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    slots: Option<HeaderSlots>,
    index: Vec<IndexEntry>,
    clock: SampleClock,
    quality: u8,
    max_frame_size: u32,
    frames: u64,
    rgb: Vec<u8>,
    jpeg: Vec<u8>,
}

impl AviMjpegEncoder {
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Created,
            format: None,
            output: None,
            file: None,
            slots: None,
            index: Vec::with_capacity(4096),
            clock: SampleClock::new(30),
            quality: 80,
            max_frame_size: 0,
            frames: 0,
            rgb: Vec::new(),
            jpeg: Vec::new(),
        }
    }

    /// Map the bitrate budget to a JPEG quality.
    fn quality_for(format: &VideoFormat) -> u8 {
        let pixels_per_second = format.width as f64 * format.height as f64 * format.fps.max(1) as f64;
        let bits_per_pixel = format.bitrate as f64 / pixels_per_second.max(1.0);
        (40.0 + bits_per_pixel * 60.0).clamp(40.0, 95.0) as u8
    }

    fn write_headers(w: &mut BufWriter<File>, format: &VideoFormat) -> Result<HeaderSlots, EncoderError> {
        let fps = format.fps.max(1);

        w.write_all(b"RIFF")?;
        let riff_size = w.stream_position()?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_all(b"AVI ")?;

        // hdrl = 'hdrl' + avih chunk (8 + 56) + strl list (12 + strh 8+56 + strf 8+40)
        let strl_size = 4 + (8 + 56) + (8 + 40);
        let hdrl_size = 4 + (8 + 56) + (8 + strl_size);
        w.write_all(b"LIST")?;
        w.write_u32::<LittleEndian>(hdrl_size)?;
        w.write_all(b"hdrl")?;

        w.write_all(b"avih")?;
        w.write_u32::<LittleEndian>(56)?;
        w.write_u32::<LittleEndian>(1_000_000 / fps)?; // dwMicroSecPerFrame
        w.write_u32::<LittleEndian>(format.bitrate / 8)?; // dwMaxBytesPerSec
        w.write_u32::<LittleEndian>(0)?; // dwPaddingGranularity
        w.write_u32::<LittleEndian>(AVIF_HASINDEX)?;
        let total_frames = w.stream_position()?;
        w.write_u32::<LittleEndian>(0)?; // dwTotalFrames
        w.write_u32::<LittleEndian>(0)?; // dwInitialFrames
        w.write_u32::<LittleEndian>(1)?; // dwStreams
        let suggested_buffer = w.stream_position()?;
        w.write_u32::<LittleEndian>(0)?; // dwSuggestedBufferSize
        w.write_u32::<LittleEndian>(format.width)?;
        w.write_u32::<LittleEndian>(format.height)?;
        for _ in 0..4 {
            w.write_u32::<LittleEndian>(0)?;
        }

        w.write_all(b"LIST")?;
        w.write_u32::<LittleEndian>(strl_size)?;
        w.write_all(b"strl")?;

        w.write_all(b"strh")?;
        w.write_u32::<LittleEndian>(56)?;
        w.write_all(b"vids")?;
        w.write_all(b"MJPG")?;
        w.write_u32::<LittleEndian>(0)?; // dwFlags
        w.write_u16::<LittleEndian>(0)?; // wPriority
        w.write_u16::<LittleEndian>(0)?; // wLanguage
        w.write_u32::<LittleEndian>(0)?; // dwInitialFrames
        w.write_u32::<LittleEndian>(1)?; // dwScale
        w.write_u32::<LittleEndian>(fps)?; // dwRate
        w.write_u32::<LittleEndian>(0)?; // dwStart
        let stream_length = w.stream_position()?;
        w.write_u32::<LittleEndian>(0)?; // dwLength
        w.write_u32::<LittleEndian>(0)?; // dwSuggestedBufferSize
        w.write_u32::<LittleEndian>(u32::MAX)?; // dwQuality, default
        w.write_u32::<LittleEndian>(0)?; // dwSampleSize, variable
        w.write_u16::<LittleEndian>(0)?;
        w.write_u16::<LittleEndian>(0)?;
        w.write_u16::<LittleEndian>(format.width as u16)?;
        w.write_u16::<LittleEndian>(format.height as u16)?;

        w.write_all(b"strf")?;
        w.write_u32::<LittleEndian>(40)?;
        w.write_u32::<LittleEndian>(40)?; // biSize
        w.write_u32::<LittleEndian>(format.width)?;
        w.write_u32::<LittleEndian>(format.height)?;
        w.write_u16::<LittleEndian>(1)?; // biPlanes
        w.write_u16::<LittleEndian>(24)?; // biBitCount
        w.write_all(b"MJPG")?;
        w.write_u32::<LittleEndian>(format.width * format.height * 3)?; // biSizeImage
        for _ in 0..4 {
            w.write_u32::<LittleEndian>(0)?;
        }

        w.write_all(b"LIST")?;
        let movi_size = w.stream_position()?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_all(b"movi")?;

        Ok(HeaderSlots {
            riff_size,
            total_frames,
            stream_length,
            suggested_buffer,
            movi_size,
        })
    }

    fn encode_jpeg(&mut self, frame: &FrameData<'_>, format: &VideoFormat) -> Result<(), EncoderError> {
        let bgra = frame_to_bgra(frame, format)?;

        self.rgb.clear();
        self.rgb.reserve(format.width as usize * format.height as usize * 3);
        for px in bgra.chunks_exact(4) {
            self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }

        self.jpeg.clear();
        JpegEncoder::new_with_quality(&mut self.jpeg, self.quality)
            .encode(&self.rgb, format.width, format.height, ExtendedColorType::Rgb8)
            .map_err(|e| EncoderError::EncodeError(format!("JPEG encode failed: {}", e)))
    }

    fn write_trailer(&mut self) -> Result<(), EncoderError> {
        let (Some(file), Some(slots)) = (self.file.as_mut(), self.slots) else {
            return Ok(());
        };

        let movi_end = file.stream_position()?;
        let idx1_size = riff_u32(self.index.len() as u64 * IDX1_ENTRY_SIZE, "idx1 size")?;
        let movi_size = riff_u32(movi_end - slots.movi_size - 4, "movi size")?;
        let riff_size = riff_u32(movi_end + idx1_size as u64, "RIFF size")?;

        file.write_all(b"idx1")?;
        file.write_u32::<LittleEndian>(idx1_size)?;
        for entry in &self.index {
            file.write_all(&FRAME_CHUNK)?;
            file.write_u32::<LittleEndian>(AVIIF_KEYFRAME)?;
            file.write_u32::<LittleEndian>(entry.offset_from_movi)?;
            file.write_u32::<LittleEndian>(entry.length)?;
        }

        let frames = riff_u32(self.frames, "frame count")?;
        let patches = [
            (slots.riff_size, riff_size),
            (slots.movi_size, movi_size),
            (slots.total_frames, frames),
            (slots.stream_length, frames),
            (slots.suggested_buffer, self.max_frame_size + 8),
        ];
        for (pos, value) in patches {
            file.seek(SeekFrom::Start(pos))?;
            file.write_u32::<LittleEndian>(value)?;
        }
        file.seek(SeekFrom::End(0))?;
        file.flush()?;
        Ok(())
    }
}

impl Default for AviMjpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for AviMjpegEncoder {
    fn initialize(&mut self, format: &VideoFormat, output: &Path) -> Result<(), EncoderError> {
        self.state.check_initialize()?;
        if format.width == 0 || format.height == 0 || format.width > u16::MAX as u32 || format.height > u16::MAX as u32 {
            return Err(EncoderError::InitError(format!(
                "invalid frame size {}x{}",
                format.width, format.height
            )));
        }
        if format.codec != VideoCodec::H264 {
            log::warn!(target: "screenrec::encoder", "AVI writer ignores codec {}, writing MJPEG", format.codec);
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(output)?);
        let slots = Self::write_headers(&mut file, format)?;

        self.quality = Self::quality_for(format);
        self.clock = SampleClock::new(format.fps);
        self.slots = Some(slots);
        self.file = Some(file);
        self.format = Some(format.clone());
        self.output = Some(output.to_path_buf());
        self.state = Lifecycle::Initialized;

        log::info!(
            target: "screenrec::encoder",
            "AVI/MJPEG writer opened {} ({}x{} @ {} fps, quality {})",
            output.display(),
            format.width,
            format.height,
            format.fps,
            self.quality
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameData<'_>) -> Result<(), EncoderError> {
        self.state.check_write()?;
        let format = self.format.clone().ok_or(EncoderError::NotInitialized)?;
        self.encode_jpeg(frame, &format)?;

        let (Some(file), Some(slots)) = (self.file.as_mut(), self.slots) else {
            return Err(EncoderError::NotInitialized);
        };

        let chunk_pos = file.stream_position()?;
        let len = self.jpeg.len() as u64;
        // Refuse the frame if the finished file (this chunk plus idx1) would not fit
        let chunk_end = chunk_pos + 8 + len + len % 2;
        let idx1_end = chunk_end + 8 + (self.index.len() as u64 + 1) * IDX1_ENTRY_SIZE;
        if idx1_end - 8 > u32::MAX as u64 {
            log::error!(
                target: "screenrec::encoder",
                "AVI file would exceed 4 GiB after {} frames, stopping",
                self.frames
            );
            return Err(EncoderError::EncodeError(format!(
                "AVI output reached the 4 GiB RIFF limit after {} frames",
                self.frames
            )));
        }
        let len = len as u32;

        file.write_all(&FRAME_CHUNK)?;
        file.write_u32::<LittleEndian>(len)?;
        file.write_all(&self.jpeg)?;
        if len % 2 == 1 {
            file.write_all(&[0])?;
        }

        // idx1 offsets are relative to the 'movi' fourcc
        self.index.push(IndexEntry {
            offset_from_movi: (chunk_pos - (slots.movi_size + 4)) as u32,
            length: len,
        });
        self.max_frame_size = self.max_frame_size.max(len);
        self.frames += 1;
        self.clock.next_sample();

        if self.frames % 300 == 0 {
            log::debug!(target: "screenrec::encoder", "AVI writer: {} frames, t={}", self.frames, self.clock.time());
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EncoderError> {
        if self.state != Lifecycle::Initialized {
            return Ok(());
        }
        self.state = Lifecycle::Finalized;

        let result = self.write_trailer();
        self.file = None;

        if self.frames == 0 {
            if let Some(path) = &self.output {
                let _ = std::fs::remove_file(path);
                log::warn!(target: "screenrec::encoder", "No frames written, removed {}", path.display());
            }
        } else {
            log::info!(target: "screenrec::encoder", "AVI finalized with {} frames", self.frames);
        }
        result
    }

    fn dispose(&mut self) {
        if let Err(e) = self.finalize() {
            log::warn!(target: "screenrec::encoder", "Finalize during dispose failed: {}", e);
        }
        self.state = Lifecycle::Disposed;
        self.rgb = Vec::new();
        self.jpeg = Vec::new();
    }

    fn sample_time(&self) -> i64 {
        self.clock.time()
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn file_extension(&self) -> &'static str {
        "avi"
    }

    fn info(&self) -> &str {
        "AVI MJPEG (Software)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn format(width: u32, height: u32) -> VideoFormat {
        VideoFormat {
            width,
            height,
            fps: 30,
            bitrate: 4_000_000,
            ..VideoFormat::default()
        }
    }

    fn read_u32(bytes: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
    }

    #[test]
    fn test_writes_valid_riff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.avi");
        let pixels = vec![0x40u8; 32 * 16 * 4];

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(32, 16), &path).unwrap();
        for i in 0..5 {
            let frame = FrameData::new(&pixels, 128, 32, 16, i, PixelFormat::Bgra32);
            enc.write_frame(&frame).unwrap();
        }
        enc.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(&bytes[8..12], b"AVI ");
        // dwTotalFrames sits after RIFF(12) + LIST hdrl(12) + avih(8) + 4 dwords
        assert_eq!(read_u32(&bytes, 12 + 12 + 8 + 16), 5);
        assert!(bytes.windows(4).any(|w| w == b"idx1"));
        assert_eq!(enc.frames_written(), 5);
    }

    #[test]
    fn test_finalize_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.avi");
        let pixels = vec![0u8; 16 * 16 * 4];

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(16, 16), &path).unwrap();
        enc.write_frame(&FrameData::new(&pixels, 64, 16, 16, 0, PixelFormat::Bgra32))
            .unwrap();
        enc.finalize().unwrap();
        let first = std::fs::read(&path).unwrap();

        enc.finalize().unwrap();
        enc.dispose();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("life.avi");
        let pixels = vec![0u8; 16 * 16 * 4];
        let frame = FrameData::new(&pixels, 64, 16, 16, 0, PixelFormat::Bgra32);

        let mut enc = AviMjpegEncoder::new();
        assert!(matches!(enc.write_frame(&frame), Err(EncoderError::NotInitialized)));

        enc.initialize(&format(16, 16), &path).unwrap();
        assert!(matches!(
            enc.initialize(&format(16, 16), &path),
            Err(EncoderError::AlreadyInitialized)
        ));

        enc.write_frame(&frame).unwrap();
        enc.finalize().unwrap();
        assert!(matches!(enc.write_frame(&frame), Err(EncoderError::Finalized)));

        enc.dispose();
        assert!(matches!(
            enc.initialize(&format(16, 16), &path),
            Err(EncoderError::Disposed)
        ));
    }

    #[test]
    fn test_sample_time_advances_per_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.avi");
        let pixels = vec![0u8; 16 * 16 * 4];

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(16, 16), &path).unwrap();
        for k in 1..=10i64 {
            // wildly uneven capture timestamps must not matter
            let frame = FrameData::new(&pixels, 64, 16, 16, k * k * 1_000_000, PixelFormat::Bgra32);
            enc.write_frame(&frame).unwrap();
            assert_eq!(enc.sample_time(), k * 333_333);
        }
    }

    #[test]
    fn test_empty_recording_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.avi");

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(16, 16), &path).unwrap();
        enc.finalize().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_frames_past_riff_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.avi");
        let pixels = vec![0x20u8; 16 * 16 * 4];
        let frame = FrameData::new(&pixels, 64, 16, 16, 0, PixelFormat::Bgra32);

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(16, 16), &path).unwrap();
        enc.write_frame(&frame).unwrap();

        // Pretend the movi list already holds 4.4 GB without allocating it
        enc.file.as_mut().unwrap().seek(SeekFrom::Start(4_400_000_000)).unwrap();
        assert!(matches!(enc.write_frame(&frame), Err(EncoderError::EncodeError(_))));
        assert_eq!(enc.frames_written(), 1);

        assert!(matches!(enc.finalize(), Err(EncoderError::FinalizeError(_))));
        assert!(std::fs::metadata(&path).unwrap().len() < 1_000_000);
    }

    #[test]
    fn test_frame_at_the_limit_edge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.avi");
        let pixels = vec![0x20u8; 16 * 16 * 4];
        let frame = FrameData::new(&pixels, 64, 16, 16, 0, PixelFormat::Bgra32);

        let mut enc = AviMjpegEncoder::new();
        enc.initialize(&format(16, 16), &path).unwrap();
        enc.file.as_mut().unwrap().seek(SeekFrom::Start(u32::MAX as u64 - 64)).unwrap();
        assert!(matches!(enc.write_frame(&frame), Err(EncoderError::EncodeError(_))));
        assert_eq!(enc.frames_written(), 0);
    }
}
