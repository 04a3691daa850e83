// Windows encoder using the Media Foundation sink writer
// RGB32 input, H.264/HEVC output muxed into MP4 by the platform

use super::{frame_to_bgra, EncoderError, Lifecycle, SampleClock, VideoCodec, VideoEncoder, VideoFormat};
use crate::capture::FrameData;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use windows::{
    core::{Interface, GUID, HSTRING},
    Win32::Media::MediaFoundation::*,
    Win32::System::Com::{CoInitializeEx, COINIT_MULTITHREADED},
};

static MF_STARTED: OnceLock<Result<(), EncoderError>> = OnceLock::new();

fn driver(call: &'static str, e: windows::core::Error) -> EncoderError {
    EncoderError::Driver {
        call,
        code: e.code().0 as u32,
        message: e.message().to_string(),
    }
}

/// Start Media Foundation once per process.
fn startup() -> Result<(), EncoderError> {
    MF_STARTED
        .get_or_init(|| unsafe {
            // S_FALSE / RPC_E_CHANGED_MODE mean COM is already up on this thread
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
            MFStartup(MF_VERSION, MFSTARTUP_FULL).map_err(|e| driver("MFStartup", e))
        })
        .clone()
}

fn set_mt_size(mt: &IMFMediaType, key: &GUID, w: u32, h: u32) -> windows::core::Result<()> {
    let attrs: IMFAttributes = mt.cast()?;
    unsafe { attrs.SetUINT64(key, ((w as u64) << 32) | h as u64) }
}

fn set_mt_ratio(mt: &IMFMediaType, key: &GUID, num: u32, den: u32) -> windows::core::Result<()> {
    let attrs: IMFAttributes = mt.cast()?;
    unsafe { attrs.SetUINT64(key, ((num as u64) << 32) | den as u64) }
}

fn output_subtype(codec: VideoCodec) -> Result<GUID, EncoderError> {
    match codec {
        VideoCodec::H264 => Ok(MFVideoFormat_H264),
        VideoCodec::Hevc => Ok(MFVideoFormat_HEVC),
        other => Err(EncoderError::PlatformUnsupported(format!(
            "Media Foundation sink writer cannot produce {}",
            other
        ))),
    }
}

struct SinkSession {
    writer: IMFSinkWriter,
    stream: u32,
}

pub struct MediaFoundationEncoder {
    state: Lifecycle,
    session: Option<SinkSession>,
    format: Option<VideoFormat>,
    output: Option<PathBuf>,
    clock: SampleClock,
    frames: u64,
}

// COM interfaces are created under the multithreaded apartment
unsafe impl Send for MediaFoundationEncoder {}

impl MediaFoundationEncoder {
    pub fn new() -> Result<Self, EncoderError> {
        startup()?;
        Ok(Self {
            state: Lifecycle::Created,
            session: None,
            format: None,
            output: None,
            clock: SampleClock::new(30),
            frames: 0,
        })
    }

    fn open_writer(format: &VideoFormat, output: &Path) -> Result<SinkSession, EncoderError> {
        let subtype = output_subtype(format.codec)?;
        let url = HSTRING::from(output.as_os_str());

        unsafe {
            let writer = MFCreateSinkWriterFromURL(&url, None, None)
                .map_err(|e| driver("MFCreateSinkWriterFromURL", e))?;

            let out_type = MFCreateMediaType().map_err(|e| driver("MFCreateMediaType", e))?;
            out_type
                .SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video)
                .and_then(|_| out_type.SetGUID(&MF_MT_SUBTYPE, &subtype))
                .and_then(|_| out_type.SetUINT32(&MF_MT_AVG_BITRATE, format.bitrate))
                .and_then(|_| set_mt_size(&out_type, &MF_MT_FRAME_SIZE, format.width, format.height))
                .and_then(|_| set_mt_ratio(&out_type, &MF_MT_FRAME_RATE, format.fps, 1))
                .and_then(|_| out_type.SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32))
                .map_err(|e| driver("IMFMediaType (output)", e))?;
            let stream = writer
                .AddStream(&out_type)
                .map_err(|e| driver("IMFSinkWriter::AddStream", e))?;

            let in_type = MFCreateMediaType().map_err(|e| driver("MFCreateMediaType", e))?;
            in_type
                .SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video)
                .and_then(|_| in_type.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_RGB32))
                .and_then(|_| set_mt_size(&in_type, &MF_MT_FRAME_SIZE, format.width, format.height))
                .and_then(|_| set_mt_ratio(&in_type, &MF_MT_FRAME_RATE, format.fps, 1))
                .and_then(|_| set_mt_ratio(&in_type, &MF_MT_PIXEL_ASPECT_RATIO, 1, 1))
                .and_then(|_| in_type.SetUINT32(&MF_MT_DEFAULT_STRIDE, format.width * 4))
                .and_then(|_| in_type.SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32))
                .map_err(|e| driver("IMFMediaType (input)", e))?;
            writer
                .SetInputMediaType(stream, &in_type, None)
                .map_err(|e| driver("IMFSinkWriter::SetInputMediaType", e))?;

            writer
                .BeginWriting()
                .map_err(|e| driver("IMFSinkWriter::BeginWriting", e))?;

            Ok(SinkSession { writer, stream })
        }
    }
}

impl VideoEncoder for MediaFoundationEncoder {
    fn initialize(&mut self, format: &VideoFormat, output: &Path) -> Result<(), EncoderError> {
        self.state.check_initialize()?;
        if format.width == 0 || format.height == 0 {
            return Err(EncoderError::InitError(format!(
                "invalid frame size {}x{}",
                format.width, format.height
            )));
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        self.session = Some(Self::open_writer(format, output)?);
        self.clock = SampleClock::new(format.fps);
        self.format = Some(format.clone());
        self.output = Some(output.to_path_buf());
        self.state = Lifecycle::Initialized;

        log::info!(
            target: "screenrec::encoder",
            "Media Foundation sink writer opened {} ({}x{} @ {} fps, {} kbps, {})",
            output.display(),
            format.width,
            format.height,
            format.fps,
            format.bitrate / 1000,
            format.codec
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameData<'_>) -> Result<(), EncoderError> {
        self.state.check_write()?;
        let (Some(session), Some(format)) = (self.session.as_ref(), self.format.as_ref()) else {
            return Err(EncoderError::NotInitialized);
        };
        let pixels = frame_to_bgra(frame, format)?;

        let (start, duration) = self.clock.next_sample();
        unsafe {
            let buffer = MFCreateMemoryBuffer(pixels.len() as u32)
                .map_err(|e| driver("MFCreateMemoryBuffer", e))?;
            let mut ptr: *mut u8 = std::ptr::null_mut();
            buffer
                .Lock(&mut ptr, None, None)
                .map_err(|e| driver("IMFMediaBuffer::Lock", e))?;
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr, pixels.len());
            buffer
                .Unlock()
                .map_err(|e| driver("IMFMediaBuffer::Unlock", e))?;
            buffer
                .SetCurrentLength(pixels.len() as u32)
                .map_err(|e| driver("IMFMediaBuffer::SetCurrentLength", e))?;

            let sample = MFCreateSample().map_err(|e| driver("MFCreateSample", e))?;
            sample
                .AddBuffer(&buffer)
                .and_then(|_| sample.SetSampleTime(start))
                .and_then(|_| sample.SetSampleDuration(duration))
                .map_err(|e| driver("IMFSample", e))?;

            session
                .writer
                .WriteSample(session.stream, &sample)
                .map_err(|e| driver("IMFSinkWriter::WriteSample", e))?;
        }

        self.frames += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EncoderError> {
        if self.state != Lifecycle::Initialized {
            return Ok(());
        }
        self.state = Lifecycle::Finalized;

        let Some(session) = self.session.take() else {
            return Ok(());
        };
        log::info!(target: "screenrec::encoder", "Finalizing MP4 with {} frames", self.frames);

        let result = unsafe { session.writer.Finalize() }
            .map_err(|e| EncoderError::FinalizeError(format!("IMFSinkWriter::Finalize: {}", e)));

        if self.frames == 0 {
            if let Some(path) = &self.output {
                let _ = std::fs::remove_file(path);
            }
        }
        result
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
        "Media Foundation (MP4)"
    }
}

impl Drop for MediaFoundationEncoder {
    fn drop(&mut self) {
        if self.state != Lifecycle::Disposed {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn test_media_foundation_round_trip() {
        let mut enc = match MediaFoundationEncoder::new() {
            Ok(enc) => enc,
            Err(e) => {
                println!("Media Foundation unavailable: {}", e);
                return;
            }
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mf.mp4");
        let format = VideoFormat {
            width: 320,
            height: 240,
            ..VideoFormat::default()
        };
        if let Err(e) = enc.initialize(&format, &path) {
            println!("No H.264 encoder MFT: {}", e);
            return;
        }

        let pixels = vec![0x80u8; 320 * 240 * 4];
        for i in 0..30 {
            let frame = FrameData::new(&pixels, 320 * 4, 320, 240, i, PixelFormat::Bgra32);
            enc.write_frame(&frame).unwrap();
        }
        assert_eq!(enc.sample_time(), 30 * 333_333);
        enc.finalize().unwrap();
        enc.finalize().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_vp9_unsupported() {
        assert!(matches!(
            output_subtype(VideoCodec::Vp9),
            Err(EncoderError::PlatformUnsupported(_))
        ));
    }
}
