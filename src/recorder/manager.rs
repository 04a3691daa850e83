//! Chooses between the native recorder and the ffmpeg fallback.
//!
//! The native path is tried first unless the caller forces ffmpeg or no
//! native service is configured. A start failure that
//! [`RecordingError::is_fallback_eligible`] reports as recoverable disposes
//! the native service and retries once with the fallback.
//!
//! Pausing stops the current service and keeps its file as a segment.
//! Resuming starts a fresh service on the next segment path, and stopping
//! joins the segments into the path the first one was recorded to.

use super::{
    segment_path, FfmpegConcat, FfmpegLocator, FfmpegRecordingService, RecordingError, RecordingEvent,
    RecordingOptions, RecordingService, RecordingStatus, ScreenRecorder, SegmentJoiner, EVENT_CAPACITY,
};
use crate::config::RecorderConfig;
use crate::encoder::verify_output;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

pub type ServiceFactory =
    Arc<dyn Fn() -> Result<Box<dyn RecordingService>, RecordingError> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Forwarded from the active service.
    Recording(RecordingEvent),
    RecordingStarted {
        using_fallback: bool,
        options: RecordingOptions,
    },
    /// The current segment is closed and kept with `segments` finished ones.
    Paused {
        segments: usize,
    },
    Resumed {
        using_fallback: bool,
    },
    RecordingCompleted(PathBuf),
}

struct ActiveSession {
    service: Arc<dyn RecordingService>,
    using_fallback: bool,
    generation: u64,
}

/// One recording from `start` to `stop`, across pauses.
struct SessionPlan {
    options: RecordingOptions,
    using_fallback: bool,
    // Output of the first segment, where the joined file goes
    final_path: Option<PathBuf>,
    segments: Vec<PathBuf>,
    paused: bool,
}

struct ManagerState {
    active: Option<ActiveSession>,
    plan: Option<SessionPlan>,
    starting: bool,
    generation: u64,
    // Session that died before `start` could register it
    failed: Option<(u64, RecordingError)>,
}

struct ManagerInner {
    native: Option<ServiceFactory>,
    fallback: Option<ServiceFactory>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ManagerEvent>,
}

pub struct RecordingManager {
    inner: Arc<ManagerInner>,
    joiner: Arc<dyn SegmentJoiner>,
}

impl RecordingManager {
    pub fn new(native: Option<ServiceFactory>, fallback: Option<ServiceFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let locator = FfmpegLocator::from_config(&RecorderConfig::default());
        Self {
            inner: Arc::new(ManagerInner {
                native,
                fallback,
                state: Mutex::new(ManagerState {
                    active: None,
                    plan: None,
                    starting: false,
                    generation: 0,
                    failed: None,
                }),
                events,
            }),
            joiner: Arc::new(FfmpegConcat::new(locator)),
        }
    }

    /// Native recorder for this platform with the ffmpeg process as fallback.
    pub fn for_platform(config: &RecorderConfig) -> Self {
        let app_name = config.app_name.clone();
        let native: ServiceFactory = Arc::new(move || {
            Ok(Box::new(ScreenRecorder::for_platform(app_name.clone())) as Box<dyn RecordingService>)
        });
        let fallback_config = config.clone();
        let fallback: ServiceFactory = Arc::new(move || {
            Ok(Box::new(FfmpegRecordingService::from_config(&fallback_config)) as Box<dyn RecordingService>)
        });
        Self::new(Some(native), Some(fallback))
            .with_joiner(Arc::new(FfmpegConcat::new(FfmpegLocator::from_config(config))))
    }

    /// Replace how paused segments are joined on stop.
    pub fn with_joiner(mut self, joiner: Arc<dyn SegmentJoiner>) -> Self {
        self.joiner = joiner;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// True while a session is recording or paused between segments.
    pub fn is_recording(&self) -> bool {
        let state = self.inner.state.lock();
        state.active.is_some() || state.plan.as_ref().is_some_and(|p| p.paused)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().plan.as_ref().is_some_and(|p| p.paused)
    }

    pub fn is_using_fallback(&self) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|s| s.using_fallback)
            .unwrap_or(false)
    }

    pub fn status(&self) -> RecordingStatus {
        let state = self.inner.state.lock();
        if state.plan.as_ref().is_some_and(|p| p.paused) {
            return RecordingStatus::Paused;
        }
        state
            .active
            .as_ref()
            .map(|s| s.service.status())
            .unwrap_or(RecordingStatus::Idle)
    }

    pub async fn start(&self, options: RecordingOptions) -> Result<(), RecordingError> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.active.is_some() || state.starting || state.plan.is_some() {
                return Err(RecordingError::AlreadyRecording);
            }
            state.starting = true;
            state.generation += 1;
            state.plan = Some(SessionPlan {
                options: options.clone(),
                using_fallback: false,
                final_path: None,
                segments: Vec::new(),
                paused: false,
            });
            state.generation
        };

        let result = self.start_with_escalation(&options, generation).await;
        let using_fallback = {
            let mut state = self.inner.state.lock();
            state.starting = false;
            match result {
                Ok(using_fallback) => {
                    if let Some(plan) = state.plan.as_mut() {
                        plan.using_fallback = using_fallback;
                    }
                    using_fallback
                }
                Err(e) => {
                    state.plan = None;
                    return Err(e);
                }
            }
        };

        let _ = self.inner.events.send(ManagerEvent::RecordingStarted {
            using_fallback,
            options,
        });
        Ok(())
    }

    /// Returns whether the fallback ended up recording.
    async fn start_with_escalation(
        &self,
        options: &RecordingOptions,
        generation: u64,
    ) -> Result<bool, RecordingError> {
        let prefer_fallback = options.settings.force_ffmpeg || self.inner.native.is_none();

        if !prefer_fallback {
            if let Some(native) = &self.inner.native {
                match self.try_service(native, options, false, generation).await {
                    Ok(()) => return Ok(false),
                    Err(e) if e.is_fallback_eligible() && self.inner.fallback.is_some() => {
                        log::warn!(
                            target: "screenrec::manager",
                            "Native recording unavailable ({}), retrying with ffmpeg",
                            e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let fallback = self
            .inner
            .fallback
            .as_ref()
            .ok_or(RecordingError::MissingFactory("fallback service"))?;
        self.try_service(fallback, options, true, generation).await?;
        Ok(true)
    }

    async fn try_service(
        &self,
        factory: &ServiceFactory,
        options: &RecordingOptions,
        using_fallback: bool,
        generation: u64,
    ) -> Result<(), RecordingError> {
        let service: Arc<dyn RecordingService> = Arc::from(factory()?);
        log::info!(
            target: "screenrec::manager",
            "Starting {} recording: {:?} {} @ {} fps",
            if using_fallback { "fallback" } else { "native" },
            options.mode,
            options.settings.codec,
            options.settings.fps
        );

        let rx = service.subscribe();
        tokio::spawn(forward_events(rx, Arc::downgrade(&self.inner), generation));

        if let Err(e) = service.start_recording(options.clone()).await {
            service.dispose();
            return Err(e);
        }

        let mut state = self.inner.state.lock();
        if let Some((failed, error)) = state.failed.take() {
            if failed == generation {
                drop(state);
                log::warn!(target: "screenrec::manager", "Session failed while starting: {}", error);
                service.dispose();
                return Err(error);
            }
        }
        state.active = Some(ActiveSession {
            service,
            using_fallback,
            generation,
        });
        Ok(())
    }

    /// Close the current segment. A no-op unless a session is recording.
    pub async fn pause(&self) -> Result<(), RecordingError> {
        let session = {
            let mut state = self.inner.state.lock();
            let recording = state.plan.as_ref().is_some_and(|p| !p.paused);
            if state.starting || !recording {
                return Ok(());
            }
            match state.active.take() {
                Some(session) => session,
                None => return Ok(()),
            }
        };
        log::info!(target: "screenrec::manager", "Pausing recording");

        let result = session.service.stop_recording().await;
        let output = match &result {
            Ok(()) => session.service.output_path(),
            Err(e) => {
                log::warn!(target: "screenrec::manager", "Segment could not be closed: {}", e);
                None
            }
        };
        session.service.dispose();

        let segments = self.inner.keep_segment(output)?;
        let _ = self.inner.events.send(ManagerEvent::Paused { segments });
        result
    }

    /// Start the next segment of a paused session. A no-op unless paused.
    pub async fn resume(&self) -> Result<(), RecordingError> {
        let (options, generation) = {
            let mut state = self.inner.state.lock();
            if state.starting || state.active.is_some() {
                return Ok(());
            }
            let options = match state.plan.as_ref() {
                Some(plan) if plan.paused => {
                    let mut options = plan.options.clone();
                    if let Some(final_path) = &plan.final_path {
                        options.output_path = Some(segment_path(final_path, plan.segments.len()));
                    }
                    // The segments are stream-copied together, so keep the same kind of service
                    options.settings.force_ffmpeg |= plan.using_fallback;
                    options
                }
                _ => return Ok(()),
            };
            state.starting = true;
            state.generation += 1;
            (options, state.generation)
        };
        log::info!(
            target: "screenrec::manager",
            "Resuming recording into {}",
            options
                .output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "a new file".to_string())
        );

        let result = self.start_with_escalation(&options, generation).await;
        let using_fallback = {
            let mut state = self.inner.state.lock();
            state.starting = false;
            let using_fallback = result?;
            let live = state.active.as_ref().is_some_and(|a| a.generation == generation);
            if let Some(plan) = state.plan.as_mut() {
                if live {
                    plan.paused = false;
                    plan.using_fallback = using_fallback;
                }
            }
            using_fallback
        };
        let _ = self.inner.events.send(ManagerEvent::Resumed { using_fallback });
        Ok(())
    }

    pub async fn toggle_pause(&self) -> Result<(), RecordingError> {
        if self.is_paused() {
            self.resume().await
        } else {
            self.pause().await
        }
    }

    /// Stop the session and join its segments. Returns the output path, or
    /// `None` when idle.
    pub async fn stop(&self) -> Result<Option<PathBuf>, RecordingError> {
        let (session, plan) = {
            let mut state = self.inner.state.lock();
            if state.starting {
                log::debug!(target: "screenrec::manager", "Stop requested while starting, ignoring");
                return Ok(None);
            }
            (state.active.take(), state.plan.take())
        };

        let mut last = None;
        if let Some(session) = session {
            let result = session.service.stop_recording().await;
            last = session.service.output_path();
            session.service.dispose();
            if let Err(e) = result {
                if let Some(plan) = plan.as_ref().filter(|p| !p.segments.is_empty()) {
                    log::warn!(
                        target: "screenrec::manager",
                        "Last segment failed, {} finished segments left on disk",
                        plan.segments.len()
                    );
                }
                return Err(e);
            }
        }

        let path = match plan {
            Some(SessionPlan {
                final_path: Some(output),
                mut segments,
                ..
            }) if !segments.is_empty() => {
                segments.extend(last);
                Some(self.join_segments(&segments, output).await?)
            }
            _ => last,
        };

        if let Some(path) = &path {
            log::info!(target: "screenrec::manager", "Recording saved to {}", path.display());
            let _ = self.inner.events.send(ManagerEvent::RecordingCompleted(path.clone()));
        }
        Ok(path)
    }

    async fn join_segments(&self, segments: &[PathBuf], output: PathBuf) -> Result<PathBuf, RecordingError> {
        if let [only] = segments {
            tokio::fs::rename(only, &output).await?;
        } else {
            if let Err(e) = self.joiner.join(segments, &output).await {
                log::error!(
                    target: "screenrec::manager",
                    "Joining {} segments failed, leaving them on disk: {}",
                    segments.len(),
                    e
                );
                return Err(e);
            }
            segments.iter().for_each(|s| remove_output(s));
        }
        verify_output(&output).map_err(RecordingError::OutputValidation)?;
        Ok(output)
    }

    /// Stop the session and delete whatever it wrote, segments included.
    pub async fn abort(&self) {
        let (session, plan) = {
            let mut state = self.inner.state.lock();
            if state.starting {
                log::debug!(target: "screenrec::manager", "Abort requested while starting, ignoring");
                return;
            }
            (state.active.take(), state.plan.take())
        };
        if session.is_none() && plan.is_none() {
            return;
        }
        log::info!(target: "screenrec::manager", "Aborting recording");

        if let Some(session) = session {
            if let Err(e) = session.service.stop_recording().await {
                log::debug!(target: "screenrec::manager", "Stop during abort: {}", e);
            }
            session.service.dispose();
            if let Some(path) = session.service.output_path() {
                remove_output(&path);
            }
        }
        if let Some(plan) = plan {
            plan.segments.iter().for_each(|s| remove_output(s));
        }
    }
}

fn remove_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::info!(target: "screenrec::manager", "Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(
            target: "screenrec::manager",
            "Could not delete {}: {}",
            path.display(),
            e
        ),
    }
}

impl ManagerInner {
    /// Detach session `generation` if it is the active one. A session still
    /// starting is marked failed instead, so `start` returns `error`.
    fn take_session(&self, generation: u64, error: RecordingError) -> Option<ActiveSession> {
        let mut state = self.state.lock();
        match &state.active {
            Some(active) if active.generation == generation => state.active.take(),
            _ => {
                if state.starting && state.generation == generation {
                    state.failed = Some((generation, error));
                }
                None
            }
        }
    }

    /// Mark the session paused and add a closed segment to it. The first
    /// segment is moved aside so its path can receive the joined file.
    fn keep_segment(&self, output: Option<PathBuf>) -> Result<usize, RecordingError> {
        let mut state = self.state.lock();
        let Some(plan) = state.plan.as_mut() else {
            return Ok(0);
        };
        plan.paused = true;
        if let Some(path) = output {
            if plan.final_path.is_some() {
                plan.segments.push(path);
            } else {
                let first = segment_path(&path, 0);
                std::fs::rename(&path, &first)?;
                plan.final_path = Some(path);
                plan.segments.push(first);
            }
        }
        Ok(plan.segments.len())
    }

    /// The session stopped without a request. Earlier segments survive as a
    /// paused session; without any the plan ends here.
    fn end_plan_or_pause(&self, output: Option<PathBuf>) -> Option<PathBuf> {
        let has_segments = {
            let mut state = self.state.lock();
            let has_segments = state.plan.as_ref().is_some_and(|p| !p.segments.is_empty());
            if !has_segments {
                state.plan = None;
            }
            has_segments
        };
        if !has_segments {
            return output;
        }
        match self.keep_segment(output) {
            Ok(segments) => {
                let _ = self.events.send(ManagerEvent::Paused { segments });
            }
            Err(e) => log::warn!(target: "screenrec::manager", "Could not keep segment: {}", e),
        }
        None
    }

    fn drop_failed_session(&self, generation: u64, error: RecordingError) {
        let Some(session) = self.take_session(generation, error) else {
            return;
        };
        log::warn!(target: "screenrec::manager", "Dropping failed session");
        session.service.dispose();
        self.end_plan_or_pause(None);
    }

    fn finish_ended_session(&self, generation: u64) {
        let ended = RecordingError::Task("recording ended while starting".to_string());
        let Some(session) = self.take_session(generation, ended) else {
            return;
        };
        let output = session.service.output_path();
        session.service.dispose();
        log::info!(target: "screenrec::manager", "Recording ended on its own");

        let Some(path) = self.end_plan_or_pause(output) else {
            return;
        };
        match verify_output(&path) {
            Ok(_) => {
                log::info!(target: "screenrec::manager", "Recording saved to {}", path.display());
                let _ = self.events.send(ManagerEvent::RecordingCompleted(path));
            }
            Err(e) => log::warn!(target: "screenrec::manager", "Ended recording is unusable: {}", e),
        }
    }
}

/// Relay one service's events until it is dropped.
///
/// Fatal errors raised while the service is still starting are reported
/// through the start result instead, so they are not forwarded. Once live,
/// a fatal error or a return to `Idle` that the manager did not ask for
/// ends the session.
async fn forward_events(
    mut rx: broadcast::Receiver<RecordingEvent>,
    inner: Weak<ManagerInner>,
    generation: u64,
) {
    let mut live = false;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!(target: "screenrec::manager", "Dropped {} recorder events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match &event {
            RecordingEvent::StatusChanged {
                status: RecordingStatus::Recording,
                ..
            } => live = true,
            RecordingEvent::ErrorOccurred { is_fatal: true, .. } if !live => continue,
            RecordingEvent::ErrorOccurred { is_fatal: true, error } => {
                let error = error.as_ref().clone();
                live = false;
                let _ = inner.events.send(ManagerEvent::Recording(event));
                inner.drop_failed_session(generation, error);
                continue;
            }
            RecordingEvent::StatusChanged {
                status: RecordingStatus::Idle,
                ..
            } if live => {
                live = false;
                let _ = inner.events.send(ManagerEvent::Recording(event));
                inner.finish_ended_session(generation);
                continue;
            }
            _ => {}
        }
        let _ = inner.events.send(ManagerEvent::Recording(event));
    }
}
