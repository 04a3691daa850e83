//! Recording through an external ffmpeg process.
//!
//! Needs no native capture or encoder support: ffmpeg grabs the screen
//! itself (gdigrab, x11grab or avfoundation) and writes the file. A stop
//! request sends `q` on stdin and kills the process if it has not exited
//! within the grace period. Disposing does the same in the background.

use super::{
    resolve_output_path, CaptureMode, RecordingError, RecordingEvent, RecordingOptions,
    RecordingService, RecordingStatus, EVENT_CAPACITY,
};
use crate::config::RecorderConfig;
use crate::encoder::{verify_output, VideoCodec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

const STDERR_TAIL_LINES: usize = 20;
const DEFAULT_STARTUP_PROBE: Duration = Duration::from_millis(300);

/// Resolves the ffmpeg executable.
///
/// Order: explicit override, tools directory, `Tools/` next to the running
/// executable, well-known install directories, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct FfmpegLocator {
    explicit: Option<PathBuf>,
    tools_dir: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
    well_known: Vec<PathBuf>,
    search_path: Option<OsString>,
}

impl FfmpegLocator {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            explicit: config.ffmpeg_path.clone(),
            tools_dir: config.tools_dir.clone(),
            exe_dir: std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf)),
            well_known: well_known_dirs(),
            search_path: std::env::var_os("PATH"),
        }
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    pub fn with_tools_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.tools_dir = dir;
        self
    }

    pub fn with_exe_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.exe_dir = dir;
        self
    }

    pub fn with_well_known(mut self, dirs: Vec<PathBuf>) -> Self {
        self.well_known = dirs;
        self
    }

    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    pub fn executable_name() -> String {
        format!("ffmpeg{}", std::env::consts::EXE_SUFFIX)
    }

    /// Candidate paths in priority order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let name = Self::executable_name();
        let mut out = Vec::new();

        if let Some(explicit) = &self.explicit {
            out.push(explicit.clone());
        }
        if let Some(dir) = &self.tools_dir {
            out.push(dir.join(&name));
        }
        if let Some(dir) = &self.exe_dir {
            out.push(dir.join("Tools").join(&name));
        }
        out.extend(self.well_known.iter().map(|d| d.join(&name)));
        if let Some(path) = &self.search_path {
            out.extend(std::env::split_paths(path).map(|d| d.join(&name)));
        }
        out
    }

    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.explicit {
            if !explicit.is_file() {
                log::warn!(
                    target: "screenrec::fallback",
                    "Configured ffmpeg path {} does not exist, searching",
                    explicit.display()
                );
            }
        }
        let found = self.candidates().into_iter().find(|p| p.is_file());
        match &found {
            Some(path) => log::info!(target: "screenrec::fallback", "Using ffmpeg at {}", path.display()),
            None => log::warn!(target: "screenrec::fallback", "ffmpeg not found"),
        }
        found
    }
}

fn well_known_dirs() -> Vec<PathBuf> {
    if cfg!(target_os = "windows") {
        let mut dirs = Vec::new();
        if let Some(pf) = std::env::var_os("ProgramFiles") {
            dirs.push(PathBuf::from(&pf).join("ffmpeg").join("bin"));
        }
        dirs.push(PathBuf::from(r"C:\ffmpeg\bin"));
        dirs
    } else {
        vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from("/usr/bin"),
        ]
    }
}

/// ffmpeg input device used to grab the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grabber {
    Gdigrab,
    X11grab,
    Avfoundation,
}

impl Grabber {
    pub fn for_current_platform() -> Self {
        if cfg!(target_os = "windows") {
            Grabber::Gdigrab
        } else if cfg!(target_os = "macos") {
            Grabber::Avfoundation
        } else {
            Grabber::X11grab
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Grabber::Gdigrab => "gdigrab",
            Grabber::X11grab => "x11grab",
            Grabber::Avfoundation => "avfoundation",
        }
    }
}

/// Builds the ffmpeg argument vector for one session.
#[derive(Debug, Clone)]
pub struct FfmpegArgs {
    grabber: Grabber,
    display: String,
    mode: CaptureMode,
    window: Option<u64>,
    region: Option<(i32, i32, u32, u32)>,
    fps: u32,
    bitrate_kbps: u32,
    codec: VideoCodec,
    show_cursor: bool,
    output: PathBuf,
}

impl FfmpegArgs {
    pub fn new(grabber: Grabber, options: &RecordingOptions, output: &Path) -> Self {
        // libx264/yuv420p reject odd dimensions
        let even = |v: u32| (v & !1).max(2);
        Self {
            grabber,
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string()),
            mode: options.mode,
            window: options.window.map(|w| w.0),
            region: options.region.map(|r| (r.x, r.y, even(r.width), even(r.height))),
            fps: options.settings.fps,
            bitrate_kbps: options.settings.bitrate_kbps,
            codec: options.settings.codec,
            show_cursor: options.settings.show_cursor,
            output: output.to_path_buf(),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }

    fn input(&self, args: &mut Vec<String>) -> Result<(), RecordingError> {
        let cursor = if self.show_cursor { "1" } else { "0" };
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        match self.grabber {
            Grabber::Gdigrab => {
                push(&["-draw_mouse", cursor]);
                match (self.mode, self.window, self.region) {
                    (CaptureMode::Window, Some(hwnd), _) => {
                        push(&["-i", &format!("hwnd={:#x}", hwnd)]);
                    }
                    (CaptureMode::Region, _, Some((x, y, w, h))) => {
                        push(&[
                            "-offset_x",
                            &x.to_string(),
                            "-offset_y",
                            &y.to_string(),
                            "-video_size",
                            &format!("{}x{}", w, h),
                            "-i",
                            "desktop",
                        ]);
                    }
                    _ => push(&["-i", "desktop"]),
                }
            }
            Grabber::X11grab => {
                push(&["-draw_mouse", cursor]);
                match (self.mode, self.window, self.region) {
                    (CaptureMode::Window, Some(id), _) => {
                        push(&["-window_id", &format!("{:#x}", id), "-i", &self.display]);
                    }
                    (CaptureMode::Region, _, Some((x, y, w, h))) => {
                        push(&[
                            "-video_size",
                            &format!("{}x{}", w, h),
                            "-i",
                            &format!("{}+{},{}", self.display, x, y),
                        ]);
                    }
                    _ => push(&["-i", &self.display]),
                }
            }
            Grabber::Avfoundation => {
                if self.mode == CaptureMode::Window {
                    return Err(RecordingError::InvalidOptions(
                        "avfoundation cannot capture a single window".to_string(),
                    ));
                }
                push(&["-capture_cursor", cursor, "-i", "Capture screen 0:none"]);
                if let (CaptureMode::Region, Some((x, y, w, h))) = (self.mode, self.region) {
                    push(&["-vf", &format!("crop={}:{}:{}:{}", w, h, x, y)]);
                }
            }
        }
        Ok(())
    }

    fn codec(&self, args: &mut Vec<String>) {
        let flags: &[&str] = match self.codec {
            VideoCodec::H264 => &["-c:v", "libx264", "-preset", "ultrafast"],
            VideoCodec::Hevc => &["-c:v", "libx265", "-preset", "ultrafast"],
            VideoCodec::Vp9 => &["-c:v", "libvpx-vp9", "-deadline", "realtime"],
            VideoCodec::Av1 => &["-c:v", "libaom-av1", "-cpu-used", "8"],
        };
        args.extend(flags.iter().map(|s| s.to_string()));
        args.push("-b:v".to_string());
        args.push(format!("{}k", self.bitrate_kbps));
    }

    pub fn build(&self) -> Result<Vec<String>, RecordingError> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            self.grabber.name(),
            "-framerate",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.fps.to_string());

        self.input(&mut args)?;
        self.codec(&mut args);

        args.extend(["-pix_fmt", "yuv420p", "-y"].iter().map(|s| s.to_string()));
        args.push(self.output.to_string_lossy().into_owned());
        Ok(args)
    }
}

struct ProcessHandle {
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<Option<ExitStatus>>,
    stopping: Arc<AtomicBool>,
    // Runtime owning the child's I/O, for shutdowns started outside it
    runtime: Handle,
}

impl ProcessHandle {
    /// Ask ffmpeg to finish the file with `q`; kill it after `grace`.
    async fn shut_down(self, grace: Duration) {
        let ProcessHandle {
            stdin,
            mut kill_tx,
            mut monitor,
            stopping,
            ..
        } = self;
        stopping.store(true, Ordering::SeqCst);

        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(b"q").await {
                log::warn!(target: "screenrec::fallback", "Could not send stop command: {}", e);
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, &mut monitor).await {
            Ok(_) => log::info!(target: "screenrec::fallback", "ffmpeg stopped gracefully"),
            Err(_) => {
                log::warn!(
                    target: "screenrec::fallback",
                    "ffmpeg still running after {:?}, killing",
                    grace
                );
                if let Some(tx) = kill_tx.take() {
                    let _ = tx.send(());
                }
                let _ = monitor.await;
            }
        }
    }
}

struct FallbackState {
    status: RecordingStatus,
    process: Option<ProcessHandle>,
    started_at: Option<Instant>,
    output_path: Option<PathBuf>,
    generation: u64,
    disposed: bool,
}

struct FallbackInner {
    locator: FfmpegLocator,
    grabber: Grabber,
    app_name: String,
    grace: Duration,
    startup_probe: Duration,
    state: Mutex<FallbackState>,
    events: broadcast::Sender<RecordingEvent>,
}

/// `RecordingService` backed by an ffmpeg child process.
pub struct FfmpegRecordingService {
    inner: Arc<FallbackInner>,
}

impl FfmpegRecordingService {
    pub fn new(locator: FfmpegLocator, app_name: impl Into<String>, grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(FallbackInner {
                locator,
                grabber: Grabber::for_current_platform(),
                app_name: app_name.into(),
                grace,
                startup_probe: DEFAULT_STARTUP_PROBE,
                state: Mutex::new(FallbackState {
                    status: RecordingStatus::Idle,
                    process: None,
                    started_at: None,
                    output_path: None,
                    generation: 0,
                    disposed: false,
                }),
                events,
            }),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(
            FfmpegLocator::from_config(config),
            config.app_name.clone(),
            Duration::from_millis(config.stop_grace_period_ms),
        )
    }

    async fn launch(&self, options: &RecordingOptions, generation: u64) -> Result<(), RecordingError> {
        let inner = &self.inner;
        let exe = inner.locator.locate().ok_or(RecordingError::FfmpegNotFound)?;
        let output = resolve_output_path(options, &inner.app_name, "mp4")?;
        let args = FfmpegArgs::new(inner.grabber, options, &output).build()?;
        inner.state.lock().output_path = Some(output.clone());

        log::info!(target: "screenrec::fallback", "Launching {} {}", exe.display(), args.join(" "));
        let mut child = Command::new(&exe)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecordingError::Process(format!("{}: {}", exe.display(), e)))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!(target: "screenrec::fallback", "ffmpeg: {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // A bad argument or missing device makes ffmpeg exit immediately
        tokio::time::sleep(inner.startup_probe).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(RecordingError::ProcessExited {
                code: status.code(),
                stderr: join_tail(&tail),
            });
        }

        let stdin = child.stdin.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let monitor = tokio::spawn(monitor_process(
            child,
            kill_rx,
            Arc::downgrade(inner),
            stopping.clone(),
            tail,
            generation,
        ));

        let mut state = inner.state.lock();
        if state.disposed || state.generation != generation || state.status != RecordingStatus::Initializing {
            let _ = kill_tx.send(());
            return Err(RecordingError::Disposed);
        }
        state.process = Some(ProcessHandle {
            stdin,
            kill_tx: Some(kill_tx),
            monitor,
            stopping,
            runtime: Handle::current(),
        });
        state.status = RecordingStatus::Recording;
        state.started_at = Some(Instant::now());
        Ok(())
    }
}

fn join_tail(tail: &Mutex<VecDeque<String>>) -> String {
    tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Wait for the child; kill it when asked or when the handle is dropped.
async fn monitor_process(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    inner: Weak<FallbackInner>,
    stopping: Arc<AtomicBool>,
    tail: Arc<Mutex<VecDeque<String>>>,
    generation: u64,
) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = &mut kill_rx => {
            log::warn!(target: "screenrec::fallback", "Killing ffmpeg process");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    };
    log::info!(target: "screenrec::fallback", "ffmpeg exited with {:?}", status);

    if stopping.load(Ordering::SeqCst) {
        return status;
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_unexpected_exit(generation, status, join_tail(&tail));
    }
    status
}

impl FallbackInner {
    fn emit_status(&self, status: RecordingStatus, elapsed: Duration) {
        log::debug!(target: "screenrec::fallback", "Status -> {}", status);
        let _ = self.events.send(RecordingEvent::StatusChanged { status, elapsed });
    }

    fn emit_error(&self, error: RecordingError, is_fatal: bool) {
        let _ = self.events.send(RecordingEvent::ErrorOccurred {
            error: Arc::new(error),
            is_fatal,
        });
    }

    /// The process ended without a stop request. A clean exit still ends the
    /// session: the service goes back to `Idle` and an output that fails
    /// verification is reported as a non-fatal error.
    fn on_unexpected_exit(&self, generation: u64, status: Option<ExitStatus>, stderr: String) {
        let (elapsed, output) = {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != RecordingStatus::Recording {
                return;
            }
            state.process = None;
            let elapsed = state.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
            (elapsed, state.output_path.clone())
        };

        let success = status.map(|s| s.success()).unwrap_or(false);
        if success {
            log::info!(target: "screenrec::fallback", "ffmpeg finished on its own after {:?}", elapsed);
            if let Some(path) = output {
                if let Err(e) = verify_output(&path) {
                    log::warn!(target: "screenrec::fallback", "Output of finished ffmpeg is unusable: {}", e);
                    self.emit_error(RecordingError::OutputValidation(e), false);
                }
            }
        } else {
            let error = RecordingError::ProcessExited {
                code: status.and_then(|s| s.code()),
                stderr,
            };
            log::error!(target: "screenrec::fallback", "{}", error);
            self.state.lock().status = RecordingStatus::Error;
            self.emit_status(RecordingStatus::Error, elapsed);
            self.emit_error(error, true);
        }

        self.state.lock().status = RecordingStatus::Idle;
        self.emit_status(RecordingStatus::Idle, elapsed);
    }

    fn fail_start(&self, generation: u64, error: &RecordingError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != RecordingStatus::Initializing {
                return;
            }
            state.status = RecordingStatus::Error;
        }
        self.emit_status(RecordingStatus::Error, Duration::ZERO);
        self.emit_error(error.clone(), true);
        self.state.lock().status = RecordingStatus::Idle;
        self.emit_status(RecordingStatus::Idle, Duration::ZERO);
    }
}

#[async_trait]
impl RecordingService for FfmpegRecordingService {
    async fn start_recording(&self, options: RecordingOptions) -> Result<(), RecordingError> {
        options.validate()?;
        let generation = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(RecordingError::Disposed);
            }
            if state.status != RecordingStatus::Idle {
                return Err(RecordingError::AlreadyRecording);
            }
            state.status = RecordingStatus::Initializing;
            state.output_path = None;
            state.generation += 1;
            state.generation
        };
        self.inner.emit_status(RecordingStatus::Initializing, Duration::ZERO);

        match self.launch(&options, generation).await {
            Ok(()) => {
                self.inner.emit_status(RecordingStatus::Recording, Duration::ZERO);
                log::info!(target: "screenrec::fallback", "Recording via ffmpeg");
                Ok(())
            }
            Err(e) => {
                log::error!(target: "screenrec::fallback", "ffmpeg start failed: {}", e);
                self.inner.fail_start(generation, &e);
                Err(e)
            }
        }
    }

    async fn stop_recording(&self) -> Result<(), RecordingError> {
        let (process, elapsed, output) = {
            let mut state = self.inner.state.lock();
            if state.status != RecordingStatus::Recording {
                return Ok(());
            }
            state.status = RecordingStatus::Finalizing;
            let elapsed = state.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
            (state.process.take(), elapsed, state.output_path.clone())
        };
        self.inner.emit_status(RecordingStatus::Finalizing, elapsed);

        if let Some(process) = process {
            process.shut_down(self.inner.grace).await;
        }

        self.inner.state.lock().status = RecordingStatus::Idle;
        self.inner.emit_status(RecordingStatus::Idle, elapsed);

        let result = match output {
            Some(path) => verify_output(&path)
                .map(|_| ())
                .map_err(RecordingError::OutputValidation),
            None => Ok(()),
        };
        if let Err(e) = &result {
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
        let process = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.status = RecordingStatus::Idle;
            state.process.take()
        };
        if let Some(process) = process {
            // Same graceful stop as stop_recording so the container gets its trailer.
            // A runtime that has already shut down dropped the child with kill_on_drop.
            log::info!(target: "screenrec::fallback", "Disposed with a running ffmpeg process, stopping it");
            process.stopping.store(true, Ordering::SeqCst);
            let runtime = process.runtime.clone();
            let grace = self.inner.grace;
            runtime.spawn(process.shut_down(grace));
        }
    }
}

impl Drop for FfmpegRecordingService {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Rect, WindowHandle};
    use crate::recorder::ScreenRecordingSettings;

    fn args_for(grabber: Grabber, options: &RecordingOptions) -> Vec<String> {
        FfmpegArgs::new(grabber, options, Path::new("out.mp4"))
            .with_display(":1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_gdigrab_region_layout() {
        let options = RecordingOptions::region(Rect::new(100, 50, 641, 480));
        let args = args_for(Grabber::Gdigrab, &options);
        let expected: Vec<String> = [
            "-hide_banner", "-loglevel", "error", "-f", "gdigrab", "-framerate", "30",
            "-draw_mouse", "1", "-offset_x", "100", "-offset_y", "50", "-video_size", "640x480",
            "-i", "desktop", "-c:v", "libx264", "-preset", "ultrafast", "-b:v", "4000k",
            "-pix_fmt", "yuv420p", "-y", "out.mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_x11grab_inputs() {
        let screen = args_for(Grabber::X11grab, &RecordingOptions::screen());
        assert!(screen.windows(2).any(|w| w == ["-i", ":1"]));

        let region = args_for(Grabber::X11grab, &RecordingOptions::region(Rect::new(10, 20, 300, 200)));
        assert!(region.windows(2).any(|w| w == ["-i", ":1+10,20"]));
        assert!(region.windows(2).any(|w| w == ["-video_size", "300x200"]));

        let window = args_for(Grabber::X11grab, &RecordingOptions::window(WindowHandle(0x2a)));
        assert!(window.windows(2).any(|w| w == ["-window_id", "0x2a"]));
    }

    #[test]
    fn test_codec_and_cursor_flags() {
        let options = RecordingOptions::screen().with_settings(ScreenRecordingSettings {
            codec: VideoCodec::Vp9,
            bitrate_kbps: 2500,
            show_cursor: false,
            ..ScreenRecordingSettings::default()
        });
        let args = args_for(Grabber::Gdigrab, &options);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx-vp9"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "2500k"]));
        assert!(args.windows(2).any(|w| w == ["-draw_mouse", "0"]));
        assert!(!args.iter().any(|a| a == "-preset"));
    }

    #[test]
    fn test_avfoundation_rejects_window() {
        let options = RecordingOptions::window(WindowHandle(1));
        assert!(matches!(
            FfmpegArgs::new(Grabber::Avfoundation, &options, Path::new("o.mp4")).build(),
            Err(RecordingError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_locator_priority() {
        let root = tempfile::tempdir().unwrap();
        let name = FfmpegLocator::executable_name();
        let mk = |dir: &str| {
            let d = root.path().join(dir);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join(&name), b"").unwrap();
            d
        };
        let tools = mk("tools");
        let exe = mk("exe");
        std::fs::create_dir_all(exe.join("Tools")).unwrap();
        std::fs::write(exe.join("Tools").join(&name), b"").unwrap();
        let known = mk("known");
        let on_path = mk("path");

        let locator = FfmpegLocator::default()
            .with_tools_dir(Some(tools.clone()))
            .with_exe_dir(Some(exe.clone()))
            .with_well_known(vec![known.clone()])
            .with_search_path(Some(on_path.clone().into_os_string()));
        assert_eq!(locator.locate(), Some(tools.join(&name)));

        let explicit = root.path().join("custom-ffmpeg");
        std::fs::write(&explicit, b"").unwrap();
        let with_explicit = locator.clone().with_explicit(Some(explicit.clone()));
        assert_eq!(with_explicit.locate(), Some(explicit));

        let no_tools = locator.clone().with_tools_dir(None);
        assert_eq!(no_tools.locate(), Some(exe.join("Tools").join(&name)));

        let only_path = FfmpegLocator::default().with_search_path(Some(on_path.clone().into_os_string()));
        assert_eq!(only_path.locate(), Some(on_path.join(&name)));

        // a missing override falls through to the next candidate
        let stale = FfmpegLocator::default()
            .with_explicit(Some(root.path().join("nope")))
            .with_well_known(vec![known.clone()]);
        assert_eq!(stale.locate(), Some(known.join(&name)));

        assert_eq!(FfmpegLocator::default().locate(), None);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_fails_start() {
        let service = FfmpegRecordingService::new(FfmpegLocator::default(), "Test", Duration::from_secs(5));
        let mut rx = service.subscribe();
        let dir = tempfile::tempdir().unwrap();

        let err = service
            .start_recording(RecordingOptions::screen().with_output(dir.path().join("x.mp4")))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordingError::FfmpegNotFound));
        assert_eq!(service.status(), RecordingStatus::Idle);

        let mut saw_fatal = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, RecordingEvent::ErrorOccurred { is_fatal: true, .. }) {
                saw_fatal = true;
            }
        }
        assert!(saw_fatal);

        // idle stop is a no-op
        service.stop_recording().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_after_grace_period() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in that ignores stdin and never exits on its own
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(FfmpegLocator::executable_name());
        let out = dir.path().join("out.mp4");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho data > '{}'\nexec sleep 30\n", out.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let service = FfmpegRecordingService::new(
            FfmpegLocator::default().with_explicit(Some(script)),
            "Test",
            Duration::from_millis(200),
        );
        service
            .start_recording(RecordingOptions::screen().with_output(&out))
            .await
            .unwrap();
        assert_eq!(service.status(), RecordingStatus::Recording);

        let started = Instant::now();
        service.stop_recording().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(service.status(), RecordingStatus::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(FfmpegLocator::executable_name());
        std::fs::write(&script, "#!/bin/sh\necho 'Unknown input format' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let service = FfmpegRecordingService::new(
            FfmpegLocator::default().with_explicit(Some(script)),
            "Test",
            Duration::from_secs(1),
        );
        let err = service
            .start_recording(RecordingOptions::screen().with_output(dir.path().join("o.mp4")))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordingError::ProcessExited { code: Some(1), .. }));
        assert_eq!(service.status(), RecordingStatus::Idle);
    }

    #[cfg(unix)]
    fn stand_in(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join(FfmpegLocator::executable_name());
        std::fs::write(&script, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dispose_lets_ffmpeg_finish() {
        // Writes the trailer only once something arrives on stdin
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = stand_in(
            &dir,
            &format!(
                "echo header > '{0}'\nread line\necho trailer >> '{0}'\n",
                out.display()
            ),
        );

        let service = FfmpegRecordingService::new(
            FfmpegLocator::default().with_explicit(Some(script)),
            "Test",
            Duration::from_secs(5),
        );
        service
            .start_recording(RecordingOptions::screen().with_output(&out))
            .await
            .unwrap();
        service.dispose();
        assert_eq!(service.status(), RecordingStatus::Idle);

        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&out).unwrap_or_default();
            if contents.contains("trailer") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(contents, "header\ntrailer\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = stand_in(&dir, &format!("echo data > '{}'\nsleep 1\n", out.display()));

        let service = FfmpegRecordingService::new(
            FfmpegLocator::default().with_explicit(Some(script)),
            "Test",
            Duration::from_secs(1),
        );
        let mut rx = service.subscribe();
        service
            .start_recording(RecordingOptions::screen().with_output(&out))
            .await
            .unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(RecordingEvent::StatusChanged { status: RecordingStatus::Idle, elapsed }) => {
                        break elapsed
                    }
                    Ok(RecordingEvent::ErrorOccurred { error, .. }) => panic!("unexpected error: {}", error),
                    Ok(_) => {}
                    Err(e) => panic!("event stream ended: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert!(ended > Duration::ZERO);
        assert_eq!(service.status(), RecordingStatus::Idle);
        assert_eq!(service.output_path(), Some(out));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = stand_in(&dir, "sleep 1\n");

        let service = FfmpegRecordingService::new(
            FfmpegLocator::default().with_explicit(Some(script)),
            "Test",
            Duration::from_secs(1),
        );
        let mut rx = service.subscribe();
        service
            .start_recording(RecordingOptions::screen().with_output(&out))
            .await
            .unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(RecordingEvent::ErrorOccurred { error, is_fatal }) = rx.recv().await {
                    break (error, is_fatal);
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(*reported.0, RecordingError::OutputValidation(_)));
        assert!(!reported.1);
    }
}
