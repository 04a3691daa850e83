//! Native recording pipeline: one capture source feeding one encoder.
//!
//! State machine:
//!
//! ```text
//! Idle -> Initializing -> Recording -> Finalizing -> Idle
//!              \              \
//!               +-> Error <----+--> (cleanup) -> Idle
//! ```
//!
//! The state lock is only held for bookkeeping. Native calls (capture
//! initialize/start/stop, encoder initialize/finalize) run outside it,
//! on the blocking pool for the async entry points.

use super::{
    resolve_output_path, RecordingError, RecordingEvent, RecordingOptions, RecordingService,
    RecordingStatus, EVENT_CAPACITY,
};
use crate::capture::{CaptureError, CaptureSource, CaptureTarget, FrameData, FrameHandler, Rect};
use crate::crop::{crop_frame, free_cropped_frame};
use crate::encoder::{verify_output, EncoderError, VideoEncoder, VideoFormat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task;

pub type CaptureFactory =
    Arc<dyn Fn() -> Result<Box<dyn CaptureSource>, CaptureError> + Send + Sync>;
pub type EncoderFactory =
    Arc<dyn Fn() -> Result<Box<dyn VideoEncoder>, EncoderError> + Send + Sync>;

/// Used when neither the region nor the capture source reports a size.
const FALLBACK_SIZE: (u32, u32) = (1920, 1080);

type SharedEncoder = Arc<Mutex<Box<dyn VideoEncoder>>>;

struct Session {
    capture: Arc<dyn CaptureSource>,
    encoder: SharedEncoder,
}

struct State {
    status: RecordingStatus,
    session: Option<Session>,
    started_at: Option<Instant>,
    output_path: Option<PathBuf>,
    disposed: bool,
}

struct Inner {
    capture_factory: Option<CaptureFactory>,
    encoder_factory: Option<EncoderFactory>,
    app_name: String,
    state: Mutex<State>,
    events: broadcast::Sender<RecordingEvent>,
    frames: AtomicU64,
    crop_warned: AtomicBool,
}

/// Native screen recorder.
pub struct ScreenRecorder {
    inner: Arc<Inner>,
}

impl ScreenRecorder {
    pub fn new(
        capture_factory: Option<CaptureFactory>,
        encoder_factory: Option<EncoderFactory>,
        app_name: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                capture_factory,
                encoder_factory,
                app_name: app_name.into(),
                state: Mutex::new(State {
                    status: RecordingStatus::Idle,
                    session: None,
                    started_at: None,
                    output_path: None,
                    disposed: false,
                }),
                events,
                frames: AtomicU64::new(0),
                crop_warned: AtomicBool::new(false),
            }),
        }
    }

    /// Recorder using the platform capture source and best available encoder.
    pub fn for_platform(app_name: impl Into<String>) -> Self {
        Self::new(
            Some(Arc::new(crate::capture::create_capture)),
            Some(Arc::new(crate::encoder::create_encoder)),
            app_name,
        )
    }

    /// Frames written in the current or last session.
    pub fn frames_written(&self) -> u64 {
        self.inner.frames.load(Ordering::SeqCst)
    }

    /// Elapsed time of the running session.
    pub fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }

    async fn start_session(&self, options: &RecordingOptions) -> Result<(), RecordingError> {
        let inner = &self.inner;
        let capture_factory = inner
            .capture_factory
            .clone()
            .ok_or(RecordingError::MissingFactory("capture source"))?;
        let encoder_factory = inner
            .encoder_factory
            .clone()
            .ok_or(RecordingError::MissingFactory("encoder"))?;

        let capture: Arc<dyn CaptureSource> = Arc::from(capture_factory()?);
        let encoder: SharedEncoder = Arc::new(Mutex::new(encoder_factory()?));
        inner.attach(Session {
            capture: capture.clone(),
            encoder: encoder.clone(),
        })?;

        let target = options.capture_target();
        let show_cursor = options.settings.show_cursor;
        {
            let capture = capture.clone();
            task::spawn_blocking(move || capture.initialize(target, show_cursor)).await??;
        }
        log::info!(
            target: "screenrec::orchestrator",
            "Capture source {} ready for {:?}",
            capture.capabilities().name,
            target
        );

        let format = video_format(options, capture.frame_size());
        let extension = encoder.lock().file_extension();
        let output = resolve_output_path(options, &inner.app_name, extension)?;
        inner.state.lock().output_path = Some(output.clone());

        {
            let encoder = encoder.clone();
            let format = format.clone();
            let output = output.clone();
            task::spawn_blocking(move || encoder.lock().initialize(&format, &output)).await??;
        }
        log::info!(
            target: "screenrec::orchestrator",
            "Encoder {} writing {}x{} @ {} fps to {}",
            encoder.lock().info(),
            format.width,
            format.height,
            format.fps,
            output.display()
        );

        // Region capture grabs the monitor and crops each frame
        let crop = match options.capture_target() {
            CaptureTarget::Region(r) => Some(Rect::new(r.x, r.y, format.width, format.height)),
            _ => None,
        };

        capture.set_target_fps(format.fps);
        capture.set_frame_handler(Some(inner.frame_handler(encoder.clone(), crop)));
        {
            let capture = capture.clone();
            task::spawn_blocking(move || capture.start()).await??;
        }

        let mut state = inner.state.lock();
        if state.status != RecordingStatus::Initializing || state.session.is_none() {
            return Err(RecordingError::Disposed);
        }
        state.status = RecordingStatus::Recording;
        state.started_at = Some(Instant::now());
        drop(state);

        inner.emit_status(RecordingStatus::Recording, Duration::ZERO);
        log::info!(target: "screenrec::orchestrator", "Recording started");
        Ok(())
    }
}

/// Format derived once per session; dimensions are rounded down to even.
fn video_format(options: &RecordingOptions, frame_size: Option<(u32, u32)>) -> VideoFormat {
    let (width, height) = match (options.capture_target(), frame_size) {
        (CaptureTarget::Region(r), _) => (r.width, r.height),
        (_, Some(size)) => size,
        (_, None) => FALLBACK_SIZE,
    };
    let even = |v: u32| (v & !1).max(2);

    VideoFormat {
        width: even(width),
        height: even(height),
        fps: options.settings.fps,
        bitrate: options.settings.bitrate_kbps.saturating_mul(1000),
        codec: options.settings.codec,
        flip_vertical: options.settings.flip_vertical,
    }
}

/// Unsubscribe, stop and release the capture source, then finalize the encoder.
fn teardown(session: Session) {
    session.capture.set_frame_handler(None);
    if let Err(e) = session.capture.stop() {
        log::warn!(target: "screenrec::orchestrator", "Capture stop failed: {}", e);
    }
    session.capture.dispose();

    let mut encoder = session.encoder.lock();
    if let Err(e) = encoder.finalize() {
        log::error!(target: "screenrec::orchestrator", "Encoder finalize reported: {}", e);
    }
    log::info!(
        target: "screenrec::orchestrator",
        "Session closed after {} frames",
        encoder.frames_written()
    );
    encoder.dispose();
}

impl Inner {
    fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn emit_status(&self, status: RecordingStatus, elapsed: Duration) {
        log::debug!(target: "screenrec::orchestrator", "Status -> {} ({:?})", status, elapsed);
        let _ = self.events.send(RecordingEvent::StatusChanged { status, elapsed });
    }

    fn emit_error(&self, error: RecordingError, is_fatal: bool) {
        let _ = self.events.send(RecordingEvent::ErrorOccurred {
            error: Arc::new(error),
            is_fatal,
        });
    }

    /// Store the session unless the recorder was disposed meanwhile.
    fn attach(&self, session: Session) -> Result<(), RecordingError> {
        let mut state = self.state.lock();
        if state.disposed || state.status != RecordingStatus::Initializing {
            drop(state);
            session.capture.dispose();
            session.encoder.lock().dispose();
            return Err(RecordingError::Disposed);
        }
        state.session = Some(session);
        Ok(())
    }

    fn frame_handler(self: &Arc<Self>, encoder: SharedEncoder, crop: Option<Rect>) -> FrameHandler {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |frame: &FrameData<'_>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame_captured(frame, &encoder, crop);
            }
        })
    }

    fn on_frame_captured(&self, frame: &FrameData<'_>, encoder: &SharedEncoder, crop: Option<Rect>) {
        // Frames outside the Recording window are dropped, never queued
        if self.state.lock().status != RecordingStatus::Recording {
            return;
        }

        let cropped = crop.and_then(|region| match crop_frame(frame, region) {
            Ok(c) => Some(c),
            Err(e) => {
                if !self.crop_warned.swap(true, Ordering::SeqCst) {
                    log::warn!(target: "screenrec::orchestrator", "Crop failed, writing full frame: {}", e);
                }
                None
            }
        });

        let result = {
            let view = cropped.as_ref().map(|c| c.as_frame());
            encoder.lock().write_frame(view.as_ref().unwrap_or(frame))
        };
        if let Some(c) = cropped {
            free_cropped_frame(c);
        }

        match result {
            Ok(()) => {
                let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
                if n % 300 == 0 {
                    log::debug!(target: "screenrec::orchestrator", "{} frames written", n);
                }
            }
            Err(e) => {
                log::error!(target: "screenrec::orchestrator", "Frame write failed: {}", e);
                self.handle_fatal(RecordingError::Encoder(e));
            }
        }
    }

    /// Move an active session to Error, clean it up once, and return to Idle.
    fn handle_fatal(&self, error: RecordingError) {
        let (session, elapsed) = {
            let mut state = self.state.lock();
            if !matches!(
                state.status,
                RecordingStatus::Initializing | RecordingStatus::Recording
            ) {
                return;
            }
            state.status = RecordingStatus::Error;
            let elapsed = state.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
            (state.session.take(), elapsed)
        };

        log::error!(target: "screenrec::orchestrator", "Fatal recording error: {}", error);
        self.emit_status(RecordingStatus::Error, elapsed);
        self.emit_error(error, true);

        if let Some(session) = session {
            teardown(session);
        }

        self.state.lock().status = RecordingStatus::Idle;
        self.emit_status(RecordingStatus::Idle, elapsed);
    }
}

#[async_trait]
impl RecordingService for ScreenRecorder {
    async fn start_recording(&self, options: RecordingOptions) -> Result<(), RecordingError> {
        options.validate()?;
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(RecordingError::Disposed);
            }
            if state.status != RecordingStatus::Idle {
                return Err(RecordingError::AlreadyRecording);
            }
            state.status = RecordingStatus::Initializing;
            state.output_path = None;
            state.started_at = None;
        }
        self.inner.frames.store(0, Ordering::SeqCst);
        self.inner.crop_warned.store(false, Ordering::SeqCst);
        self.inner.emit_status(RecordingStatus::Initializing, Duration::ZERO);

        match self.start_session(&options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.handle_fatal(e.clone());
                Err(e)
            }
        }
    }

    async fn stop_recording(&self) -> Result<(), RecordingError> {
        let (session, elapsed, output) = {
            let mut state = self.inner.state.lock();
            if state.status != RecordingStatus::Recording {
                return Ok(());
            }
            state.status = RecordingStatus::Finalizing;
            let elapsed = state.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
            (state.session.take(), elapsed, state.output_path.clone())
        };
        self.inner.emit_status(RecordingStatus::Finalizing, elapsed);
        log::info!(target: "screenrec::orchestrator", "Stopping after {:?}", elapsed);

        let result = match session {
            Some(session) => task::spawn_blocking(move || {
                teardown(session);
                match output {
                    Some(path) => verify_output(&path).map(|_| ()).map_err(RecordingError::OutputValidation),
                    None => Ok(()),
                }
            })
            .await
            .map_err(RecordingError::from)
            .and_then(|r| r),
            None => Ok(()),
        };

        self.inner.state.lock().status = RecordingStatus::Idle;
        self.inner.emit_status(RecordingStatus::Idle, elapsed);

        if let Err(e) = &result {
            log::error!(target: "screenrec::orchestrator", "Recording did not produce a valid file: {}", e);
            self.inner.emit_error(e.clone(), false);
        }
        result
    }

    fn status(&self) -> RecordingStatus {
        self.inner.state.lock().status
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.inner.events.subscribe()
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.inner.state.lock().output_path.clone()
    }

    fn dispose(&self) {
        let (session, output, was_active, elapsed) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let was_active = state.status != RecordingStatus::Idle;
            let mut elapsed = Duration::ZERO;
            // A stop in flight already took the session and owns finalization
            if state.session.is_some() {
                state.status = RecordingStatus::Idle;
                elapsed = state.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
            }
            (state.session.take(), state.output_path.clone(), was_active, elapsed)
        };

        if let Some(session) = session {
            log::info!(target: "screenrec::orchestrator", "Disposing with an active session");
            teardown(session);
            if let Some(path) = output {
                if let Err(e) = verify_output(&path) {
                    log::warn!(target: "screenrec::orchestrator", "Output after dispose: {}", e);
                }
            }
            if was_active {
                self.inner.emit_status(RecordingStatus::Idle, elapsed);
            }
        }
    }
}

impl Drop for ScreenRecorder {
    fn drop(&mut self) {
        self.dispose();
    }
}
