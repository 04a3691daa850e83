//! Paced capture thread shared by the polling backends.
//!
//! A backend supplies two pieces: a `CaptureBackend` that probes targets on the
//! caller's thread, and a `FrameGrabber` that is opened and driven entirely on
//! the capture thread (so thread-affine handles such as COM devices or X
//! connections never cross threads).

use super::{
    BackendCapabilities, CaptureError, CaptureSource, CaptureTarget, FrameData, FrameHandler,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

const DEFAULT_FPS: u32 = 30;
const MAX_CONSECUTIVE_FAILURES: u32 = 100;

/// Outcome of one grab attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOutcome {
    Delivered,
    /// Nothing new to deliver this tick.
    Skipped,
}

/// Lives on the capture thread for the duration of one start/stop cycle.
pub trait FrameGrabber {
    /// Capture one frame and hand it to `deliver` while the pixels are valid.
    fn grab(
        &mut self,
        timestamp: i64,
        deliver: &mut dyn FnMut(&FrameData<'_>),
    ) -> Result<GrabOutcome, CaptureError>;
}

/// Platform half of a threaded capture source.
pub trait CaptureBackend: Send + Sync + 'static {
    type Grabber: FrameGrabber;

    fn capabilities(&self) -> BackendCapabilities;

    /// Check the target is serviceable and report the frame size.
    fn probe(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError>;

    /// Open the grabber. Always called on the capture thread.
    fn open(&self, target: &CaptureTarget, show_cursor: bool)
        -> Result<Self::Grabber, CaptureError>;
}

/// Handle to a running capture thread.
pub struct CaptureWorker {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl CaptureWorker {
    /// Spawn the capture thread and wait until the grabber has opened.
    pub fn spawn<B: CaptureBackend>(
        backend: Arc<B>,
        target: CaptureTarget,
        show_cursor: bool,
        fps: u32,
        handler: Arc<RwLock<Option<FrameHandler>>>,
    ) -> Result<Self, CaptureError> {
        let (init_tx, init_rx) = bounded::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let name = backend.capabilities().name;

        let handle = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let grabber = match backend.open(&target, show_cursor) {
                    Ok(g) => {
                        let _ = init_tx.send(Ok(()));
                        g
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                run_capture_loop(grabber, fps, &handler, &stop_rx);
            })
            .map_err(|e| CaptureError::InitError(format!("Failed to spawn capture thread: {}", e)))?;

        let thread_id = handle.thread().id();

        match init_rx.recv() {
            Ok(Ok(())) => {
                log::info!(target: "screenrec::capture", "{} capture thread running at {} fps", name, fps);
                Ok(Self {
                    stop_tx,
                    handle: Some(handle),
                    thread_id,
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::InitError(
                    "Capture thread exited during initialization".to_string(),
                ))
            }
        }
    }

    /// Signal the thread and join it, unless called from the thread itself.
    pub fn stop(mut self) {
        let _ = self.stop_tx.try_send(());
        let Some(handle) = self.handle.take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            log::debug!(target: "screenrec::capture", "Stop requested from capture thread, detaching");
            return;
        }
        if handle.join().is_err() {
            log::error!(target: "screenrec::capture", "Capture thread panicked");
        }
    }
}

fn run_capture_loop<G: FrameGrabber>(
    mut grabber: G,
    fps: u32,
    handler: &RwLock<Option<FrameHandler>>,
    stop_rx: &Receiver<()>,
) {
    let interval = Duration::from_nanos(1_000_000_000 / fps.max(1) as u64);
    let started = Instant::now();
    let mut failures = 0u32;
    let mut delivered = 0u64;

    loop {
        let tick = Instant::now();
        let timestamp = (started.elapsed().as_nanos() / 100) as i64;

        // Clone the handler out so the lock is not held during the callback
        let current = handler.read().clone();
        let outcome = grabber.grab(timestamp, &mut |frame| {
            if let Some(h) = current.as_ref() {
                h(frame);
            }
        });

        match outcome {
            Ok(GrabOutcome::Delivered) => {
                failures = 0;
                delivered += 1;
            }
            Ok(GrabOutcome::Skipped) => {}
            Err(e) => {
                failures += 1;
                log::warn!(target: "screenrec::capture", "Frame grab failed ({}): {}", failures, e);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!(target: "screenrec::capture", "Giving up after {} consecutive failures", failures);
                    break;
                }
            }
        }

        let wait = interval.saturating_sub(tick.elapsed());
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!(target: "screenrec::capture", "Capture thread exiting after {} frames", delivered);
}

struct SourceState {
    target: Option<CaptureTarget>,
    show_cursor: bool,
    frame_size: Option<(u32, u32)>,
    worker: Option<CaptureWorker>,
    disposed: bool,
}

/// `CaptureSource` implementation that drives a backend on a paced thread.
pub struct ThreadedCaptureSource<B: CaptureBackend> {
    backend: Arc<B>,
    state: Mutex<SourceState>,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    fps: AtomicU32,
}

impl<B: CaptureBackend> ThreadedCaptureSource<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            state: Mutex::new(SourceState {
                target: None,
                show_cursor: true,
                frame_size: None,
                worker: None,
                disposed: false,
            }),
            handler: Arc::new(RwLock::new(None)),
            fps: AtomicU32::new(DEFAULT_FPS),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().worker.is_some()
    }
}

impl<B: CaptureBackend> CaptureSource for ThreadedCaptureSource<B> {
    fn initialize(&self, target: CaptureTarget, show_cursor: bool) -> Result<(), CaptureError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(CaptureError::Disposed);
        }
        if state.target.is_some() {
            return Err(CaptureError::InvalidOperation(
                "Capture source already initialized".to_string(),
            ));
        }

        let size = self.backend.probe(&target)?;
        log::info!(
            target: "screenrec::capture",
            "{} initialized for {:?} ({}x{}, cursor: {})",
            self.backend.capabilities().name,
            target,
            size.0,
            size.1,
            show_cursor
        );

        state.target = Some(target);
        state.show_cursor = show_cursor;
        state.frame_size = Some(size);
        Ok(())
    }

    fn set_target_fps(&self, fps: u32) {
        self.fps.store(fps.max(1), Ordering::SeqCst);
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        self.state.lock().frame_size
    }

    fn start(&self) -> Result<(), CaptureError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(CaptureError::Disposed);
        }
        if state.worker.is_some() {
            return Ok(());
        }
        let target = state.target.ok_or_else(|| {
            CaptureError::InvalidOperation("Capture source not initialized".to_string())
        })?;

        let worker = CaptureWorker::spawn(
            self.backend.clone(),
            target,
            state.show_cursor,
            self.fps.load(Ordering::SeqCst),
            self.handler.clone(),
        )?;
        state.worker = Some(worker);
        Ok(())
    }

    fn stop(&self) -> Result<(), CaptureError> {
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            worker.stop();
            log::info!(target: "screenrec::capture", "Stopped {} capture", self.backend.capabilities().name);
        }
        Ok(())
    }

    fn set_frame_handler(&self, handler: Option<FrameHandler>) {
        *self.handler.write() = handler;
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    fn dispose(&self) {
        let _ = self.stop();
        let mut state = self.state.lock();
        if !state.disposed {
            state.disposed = true;
            state.target = None;
            *self.handler.write() = None;
            log::debug!(target: "screenrec::capture", "Disposed {} capture source", self.backend.capabilities().name);
        }
    }
}

impl<B: CaptureBackend> Drop for ThreadedCaptureSource<B> {
    fn drop(&mut self) {
        if let Some(worker) = self.state.get_mut().worker.take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    struct SyntheticBackend {
        fail_open: bool,
    }

    struct SyntheticGrabber {
        pixels: Vec<u8>,
    }

    impl FrameGrabber for SyntheticGrabber {
        fn grab(
            &mut self,
            timestamp: i64,
            deliver: &mut dyn FnMut(&FrameData<'_>),
        ) -> Result<GrabOutcome, CaptureError> {
            let frame = FrameData::new(&self.pixels, 16, 4, 4, timestamp, PixelFormat::Bgra32);
            deliver(&frame);
            Ok(GrabOutcome::Delivered)
        }
    }

    impl CaptureBackend for SyntheticBackend {
        type Grabber = SyntheticGrabber;

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                name: "synthetic",
                hardware_accelerated: false,
                supports_cursor: false,
                per_monitor_dpi: false,
                requires_permission: false,
            }
        }

        fn probe(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
            match target {
                CaptureTarget::Window(_) => Err(CaptureError::PlatformUnsupported(
                    "window capture".to_string(),
                )),
                _ => Ok((4, 4)),
            }
        }

        fn open(&self, _: &CaptureTarget, _: bool) -> Result<SyntheticGrabber, CaptureError> {
            if self.fail_open {
                return Err(CaptureError::InitError("device lost".to_string()));
            }
            Ok(SyntheticGrabber {
                pixels: vec![0x80; 64],
            })
        }
    }

    fn source(fail_open: bool) -> Arc<ThreadedCaptureSource<SyntheticBackend>> {
        let src = ThreadedCaptureSource::with_backend(SyntheticBackend { fail_open });
        src.set_target_fps(200);
        Arc::new(src)
    }

    #[test]
    fn test_initialize_twice_is_invalid() {
        let src = source(false);
        src.initialize(CaptureTarget::PrimaryMonitor, true).unwrap();
        assert_eq!(src.frame_size(), Some((4, 4)));
        assert!(matches!(
            src.initialize(CaptureTarget::PrimaryMonitor, true),
            Err(CaptureError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_unsupported_target_rejected() {
        let src = source(false);
        let result = src.initialize(CaptureTarget::Window(crate::capture::WindowHandle(1)), false);
        assert!(matches!(result, Err(CaptureError::PlatformUnsupported(_))));
    }

    #[test]
    fn test_start_without_initialize_fails() {
        let src = source(false);
        assert!(matches!(src.start(), Err(CaptureError::InvalidOperation(_))));
    }

    #[test]
    fn test_open_failure_reported_to_start() {
        let src = source(true);
        src.initialize(CaptureTarget::PrimaryMonitor, false).unwrap();
        assert!(matches!(src.start(), Err(CaptureError::InitError(_))));
        assert!(!src.is_capturing());
    }

    #[test]
    fn test_frames_delivered_and_stop_is_idempotent() {
        let src = source(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        src.set_frame_handler(Some(Arc::new(move |frame: &FrameData<'_>| {
            assert_eq!(frame.width, 4);
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        src.initialize(CaptureTarget::PrimaryMonitor, false).unwrap();
        src.start().unwrap();
        src.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        src.stop().unwrap();
        src.stop().unwrap();

        let seen = count.load(Ordering::SeqCst);
        assert!(seen > 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_stop_from_frame_handler_does_not_deadlock() {
        let src = source(false);
        let weak = Arc::downgrade(&src);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        src.set_frame_handler(Some(Arc::new(move |_: &FrameData<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(src) = weak.upgrade() {
                let _ = src.stop();
            }
        })));

        src.initialize(CaptureTarget::PrimaryMonitor, false).unwrap();
        src.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(!src.is_capturing());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_is_repeatable() {
        let src = source(false);
        src.initialize(CaptureTarget::PrimaryMonitor, false).unwrap();
        src.start().unwrap();
        src.dispose();
        src.dispose();
        assert!(matches!(src.start(), Err(CaptureError::Disposed)));
        assert!(matches!(
            src.initialize(CaptureTarget::PrimaryMonitor, false),
            Err(CaptureError::Disposed)
        ));
    }
}
