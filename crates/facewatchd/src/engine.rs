//! Capture/render engine.
//!
//! The engine runs on a dedicated OS thread. It owns the video source, both
//! models, the gallery and the unknown event logger, and reports back through
//! a single `mpsc` channel of [`EngineEvent`]s. State changes are sent with
//! `blocking_send` and never lost; frame updates use `try_send` and are
//! dropped when the receiver falls behind.

use chrono::Local;
use facewatch_core::{
    ArcFaceEmbedder, ConfigError, DetectorError, EmbeddingMatcher, FaceDetector, FaceEmbedder, GalleryError,
    GalleryIndex, IdentityResolver, RecognitionConfig, RecognitionPipeline, RecognizerError, ScrfdDetector,
    UnknownEvent, UnknownEventLogger,
};
use facewatch_hw::{CaptureError, SourceError, VideoSource};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("video source error: {0}")]
    Source(#[from] SourceError),
    #[error("model error: {0}")]
    Model(String),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("{count} consecutive frame failures, last: {last}")]
    FrameFailures { count: usize, last: String },
    #[error("video device lost: {0}")]
    DeviceLost(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<DetectorError> for EngineError {
    fn from(e: DetectorError) -> Self {
        Self::Model(format!("detector: {e}"))
    }
}

impl From<RecognizerError> for EngineError {
    fn from(e: RecognizerError) -> Self {
        Self::Model(format!("recognizer: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    Error(String),
}

/// Engine lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    LoadingModel,
    WarmingCache,
    Running,
    Stopped(StopReason),
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::LoadingModel => "loading_model",
            Self::WarmingCache => "warming_cache",
            Self::Running => "running",
            Self::Stopped(_) => "stopped",
        }
    }
}

/// One processed frame.
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    pub sequence: u64,
    pub annotated: RgbImage,
    pub known: usize,
    pub unknown: usize,
    /// Set when this frame produced a persisted unknown event.
    pub logged: Option<UnknownEvent>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    State(EngineState),
    Frame(FrameUpdate),
}

/// Cooperative cancellation flag, checked between start-up phases and between frames.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request a stop. Returns `false` if one was already requested.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owner's handle to the engine thread.
pub struct EngineHandle {
    stop: StopHandle,
    thread: std::thread::JoinHandle<StopReason>,
}

impl EngineHandle {
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the thread to exit and return why it stopped.
    pub fn join(self) -> StopReason {
        self.thread
            .join()
            .unwrap_or_else(|_| StopReason::Error("engine thread panicked".into()))
    }
}

/// Builds the engine's resources. Called on the engine thread, in order.
pub trait Components: Send + 'static {
    fn open_source(&mut self, config: &RecognitionConfig) -> Result<Box<dyn VideoSource>, EngineError>;
    fn load_detector(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceDetector>, EngineError>;
    fn load_embedder(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceEmbedder>, EngineError>;
}

/// V4L2 or image-directory source, SCRFD detector and ArcFace embedder.
pub struct OnnxComponents;

impl Components for OnnxComponents {
    fn open_source(&mut self, config: &RecognitionConfig) -> Result<Box<dyn VideoSource>, EngineError> {
        Ok(facewatch_hw::open_source(&config.source)?)
    }

    fn load_detector(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceDetector>, EngineError> {
        let path = config.scrfd_model_path();
        let detector = ScrfdDetector::load(&path, config.detection_confidence)?;
        tracing::info!(path = %path.display(), "SCRFD detector loaded");
        Ok(Box::new(detector))
    }

    fn load_embedder(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceEmbedder>, EngineError> {
        let path = config.arcface_model_path();
        let embedder = ArcFaceEmbedder::load(&path)?;
        tracing::info!(path = %path.display(), "ArcFace embedder loaded");
        Ok(Box::new(embedder))
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// All resources are acquired on the engine thread; failures surface as a
/// terminal `Stopped(Error)` state rather than from this call.
pub fn spawn_engine<C: Components>(
    config: RecognitionConfig,
    components: C,
    events: mpsc::Sender<EngineEvent>,
) -> Result<EngineHandle, EngineError> {
    let stop = StopHandle::default();
    let thread_stop = stop.clone();

    let thread = std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let reason = run(&config, components, &events, &thread_stop);
            tracing::info!(reason = ?reason, "engine thread exiting");
            reason
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { stop, thread })
}

fn run<C: Components>(
    config: &RecognitionConfig,
    mut components: C,
    events: &mpsc::Sender<EngineEvent>,
    stop: &StopHandle,
) -> StopReason {
    let reason = match session(config, &mut components, events, stop) {
        Ok(reason) => reason,
        Err(e) => {
            tracing::error!(error = %e, "engine stopped on error");
            StopReason::Error(e.to_string())
        }
    };
    send_state(events, EngineState::Stopped(reason.clone()));
    reason
}

fn send_state(events: &mpsc::Sender<EngineEvent>, state: EngineState) {
    tracing::debug!(state = state.name(), "engine state");
    // A closed channel means nobody is listening; the stop flag or the
    // frame publisher ends the loop.
    let _ = events.blocking_send(EngineEvent::State(state));
}

fn session<C: Components>(
    config: &RecognitionConfig,
    components: &mut C,
    events: &mpsc::Sender<EngineEvent>,
    stop: &StopHandle,
) -> Result<StopReason, EngineError> {
    send_state(events, EngineState::Initializing);
    config.validate()?;
    let source = OwnedSource::new(components.open_source(config)?);

    if stop_requested(stop, "initializing") {
        return Ok(StopReason::Cancelled);
    }
    send_state(events, EngineState::LoadingModel);
    let mut detector = components.load_detector(config)?;
    let mut embedder = components.load_embedder(config)?;

    if stop_requested(stop, "loading models") {
        return Ok(StopReason::Cancelled);
    }
    send_state(events, EngineState::WarmingCache);
    let gallery = GalleryIndex::build(
        &config.known_faces_dir,
        detector.as_mut(),
        embedder.as_mut(),
        config.gallery_cache_path(),
    )?;
    tracing::info!(
        identities = gallery.len(),
        references = gallery.reference_count(),
        "gallery ready"
    );

    let mut pipeline = RecognitionPipeline::new(
        detector,
        EmbeddingMatcher::new(embedder),
        IdentityResolver::new(config.threshold),
    );
    if stop_requested(stop, "building gallery") {
        return Ok(StopReason::Cancelled);
    }
    let elapsed = pipeline.warm_up(&gallery);
    tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "warm-up complete");

    let mut recognition = RecognitionLoop {
        source,
        pipeline,
        gallery,
        logger: UnknownEventLogger::new(&config.unknown_log_dir, config.unknown_cooldown),
        max_consecutive_failures: config.max_consecutive_failures,
    };

    if stop_requested(stop, "warming up") {
        return Ok(StopReason::Cancelled);
    }
    send_state(events, EngineState::Running);
    recognition.run(events, stop)
}

fn stop_requested(stop: &StopHandle, phase: &'static str) -> bool {
    let stopped = stop.is_stopped();
    if stopped {
        tracing::info!(phase, "stop requested during start-up");
    }
    stopped
}

/// Logs the release of the video source on every exit path.
struct OwnedSource {
    inner: Box<dyn VideoSource>,
    description: String,
}

impl OwnedSource {
    fn new(inner: Box<dyn VideoSource>) -> Self {
        let description = inner.describe();
        tracing::info!(source = %description, "video source opened");
        Self { inner, description }
    }
}

impl Drop for OwnedSource {
    fn drop(&mut self) {
        tracing::info!(source = %self.description, "video source released");
    }
}

struct RecognitionLoop {
    source: OwnedSource,
    pipeline: RecognitionPipeline<Box<dyn FaceDetector>, EmbeddingMatcher<Box<dyn FaceEmbedder>>>,
    gallery: GalleryIndex,
    logger: UnknownEventLogger,
    max_consecutive_failures: usize,
}

impl RecognitionLoop {
    fn run(&mut self, events: &mpsc::Sender<EngineEvent>, stop: &StopHandle) -> Result<StopReason, EngineError> {
        let mut failures = 0usize;
        let mut dropped = 0u64;

        loop {
            if stop.is_stopped() {
                tracing::info!("stop requested");
                return Ok(StopReason::Cancelled);
            }

            let frame = match self.source.inner.next_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(CaptureError::NoFrame(reason)) => {
                    failures += 1;
                    tracing::debug!(failures, %reason, "frame acquisition failed");
                    if failures >= self.max_consecutive_failures {
                        return Err(EngineError::FrameFailures {
                            count: failures,
                            last: reason,
                        });
                    }
                    continue;
                }
                Err(CaptureError::EndOfStream) => {
                    tracing::info!("end of stream");
                    return Ok(StopReason::EndOfStream);
                }
                Err(CaptureError::DeviceLost(reason)) => return Err(EngineError::DeviceLost(reason)),
            };

            let report = self.pipeline.process(&frame.image, &self.gallery);

            let logged = if report.has_unknown() {
                match self.logger.maybe_log(&report.annotated, Local::now()) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to record unknown event");
                        None
                    }
                }
            } else {
                None
            };

            let update = FrameUpdate {
                sequence: frame.sequence,
                known: report.known_count(),
                unknown: report.unknown_count(),
                annotated: report.annotated,
                logged,
            };

            match events.try_send(EngineEvent::Frame(update)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        tracing::debug!(dropped, "display sink behind; dropping frames");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::info!("event receiver closed");
                    return Ok(StopReason::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{Embedding, FaceRegion};
    use facewatch_hw::Frame;
    use image::Rgb;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::time::Duration;

    /// Plays queued results, then `EndOfStream`.
    struct ScriptedSource(VecDeque<Result<Frame, CaptureError>>);

    impl VideoSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            self.0.pop_front().unwrap_or(Err(CaptureError::EndOfStream))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Endless identical frames.
    struct Endless(RgbImage, u64);

    impl VideoSource for Endless {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(2));
            self.1 += 1;
            Ok(Frame::new(self.0.clone(), self.1))
        }

        fn describe(&self) -> String {
            "endless".into()
        }
    }

    /// One fixed face region per image.
    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(vec![FaceRegion { x: 8.0, y: 8.0, width: 40.0, height: 40.0, confidence: 0.9 }])
        }
    }

    /// Maps the mean red value of a crop onto a quarter circle.
    struct RedAngle;

    impl FaceEmbedder for RedAngle {
        fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
            let n = (crop.width() * crop.height()).max(1) as f32;
            let red = crop.pixels().map(|p| p[0] as f32).sum::<f32>() / n;
            let angle = red / 255.0 * std::f32::consts::FRAC_PI_2;
            Ok(Embedding { values: vec![angle.cos(), angle.sin()], model_version: None })
        }
    }

    struct Fakes {
        source: Option<Box<dyn VideoSource>>,
    }

    impl Components for Fakes {
        fn open_source(&mut self, _config: &RecognitionConfig) -> Result<Box<dyn VideoSource>, EngineError> {
            self.source
                .take()
                .ok_or_else(|| EngineError::DeviceLost("no source".into()))
        }

        fn load_detector(&mut self, _config: &RecognitionConfig) -> Result<Box<dyn FaceDetector>, EngineError> {
            Ok(Box::new(OneFace))
        }

        fn load_embedder(&mut self, _config: &RecognitionConfig) -> Result<Box<dyn FaceEmbedder>, EngineError> {
            Ok(Box::new(RedAngle))
        }
    }

    const KNOWN_RED: u8 = 250;
    const STRANGER_RED: u8 = 20;

    fn image(red: u8) -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([red, 40, 40]))
    }

    fn frames(reds: &[u8]) -> VecDeque<Result<Frame, CaptureError>> {
        reds.iter()
            .enumerate()
            .map(|(i, &r)| Ok(Frame::new(image(r), i as u64 + 1)))
            .collect()
    }

    /// Gallery with one identity, "Ada".
    fn fixture(root: &Path) -> RecognitionConfig {
        let known = root.join("known_faces");
        std::fs::create_dir_all(known.join("Ada")).unwrap();
        image(KNOWN_RED).save(known.join("Ada").join("1.png")).unwrap();

        RecognitionConfig {
            known_faces_dir: known,
            source: "scripted".into(),
            model_dir: root.join("models"),
            threshold: 0.55,
            detection_confidence: 0.5,
            unknown_log_dir: root.join("unknown_logs"),
            unknown_cooldown: Duration::from_secs(3600),
            max_consecutive_failures: 3,
            gallery_cache: None,
        }
    }

    fn run_to_end(config: RecognitionConfig, source: Box<dyn VideoSource>) -> (StopReason, Vec<EngineEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_engine(config, Fakes { source: Some(source) }, tx).unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            events.push(event);
        }
        (handle.join(), events)
    }

    fn states(events: &[EngineEvent]) -> Vec<EngineState> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::State(s) => Some(s.clone()),
                EngineEvent::Frame(_) => None,
            })
            .collect()
    }

    fn updates(events: &[EngineEvent]) -> Vec<&FrameUpdate> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Frame(u) => Some(u),
                EngineEvent::State(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_known_faces_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let (reason, events) =
            run_to_end(config, Box::new(ScriptedSource(frames(&[KNOWN_RED, KNOWN_RED]))));

        assert_eq!(reason, StopReason::EndOfStream);
        assert_eq!(
            states(&events),
            vec![
                EngineState::Initializing,
                EngineState::LoadingModel,
                EngineState::WarmingCache,
                EngineState::Running,
                EngineState::Stopped(StopReason::EndOfStream),
            ]
        );
        let updates = updates(&events);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.known == 1 && u.unknown == 0 && u.logged.is_none()));
        assert!(!dir.path().join("unknown_logs").exists());
    }

    #[test]
    fn test_empty_gallery_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        config.known_faces_dir = dir.path().join("empty");
        std::fs::create_dir_all(&config.known_faces_dir).unwrap();

        let (reason, events) = run_to_end(config, Box::new(ScriptedSource(frames(&[KNOWN_RED]))));

        assert!(matches!(reason, StopReason::Error(_)));
        let states = states(&events);
        assert!(!states.contains(&EngineState::Running));
        assert!(matches!(states.last(), Some(EngineState::Stopped(StopReason::Error(_)))));
        assert!(updates(&events).is_empty());
    }

    #[test]
    fn test_invalid_config_stops_before_opening_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        config.threshold = f32::NAN;

        let (reason, events) = run_to_end(config, Box::new(ScriptedSource(VecDeque::new())));

        assert!(matches!(reason, StopReason::Error(ref m) if m.contains("threshold")));
        assert_eq!(states(&events)[0], EngineState::Initializing);
        assert!(!states(&events).contains(&EngineState::LoadingModel));
    }

    #[test]
    fn test_unknown_faces_respect_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let log_dir = config.unknown_log_dir.clone();
        let source = ScriptedSource(frames(&[STRANGER_RED, KNOWN_RED, STRANGER_RED, STRANGER_RED]));

        let (reason, events) = run_to_end(config, Box::new(source));

        assert_eq!(reason, StopReason::EndOfStream);
        let updates = updates(&events);
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].unknown, 1);
        assert!(updates[0].logged.is_some());
        assert!(updates[1..].iter().all(|u| u.logged.is_none()));

        let entries = facewatch_core::UnknownLog::new(&log_dir).entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].image_path.exists());
    }

    #[test]
    fn test_transient_failures_reset_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let no_frame = || Err(CaptureError::NoFrame("timeout".into()));
        let script = VecDeque::from(vec![
            no_frame(),
            no_frame(),
            Ok(Frame::new(image(KNOWN_RED), 1)),
            no_frame(),
            no_frame(),
        ]);

        let (reason, events) = run_to_end(config, Box::new(ScriptedSource(script)));

        assert_eq!(reason, StopReason::EndOfStream);
        assert_eq!(updates(&events).len(), 1);
    }

    #[test]
    fn test_persistent_failures_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let script = (0..5).map(|_| Err(CaptureError::NoFrame("timeout".into()))).collect();

        let (reason, _) = run_to_end(config, Box::new(ScriptedSource(script)));

        assert!(matches!(reason, StopReason::Error(ref m) if m.contains("3 consecutive")));
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let script = VecDeque::from(vec![Err(CaptureError::DeviceLost("unplugged".into()))]);

        let (reason, _) = run_to_end(config, Box::new(ScriptedSource(script)));

        assert!(matches!(reason, StopReason::Error(ref m) if m.contains("unplugged")));
    }

    #[test]
    fn test_stop_cancels_running_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let (tx, mut rx) = mpsc::channel(4);
        let source = Box::new(Endless(image(KNOWN_RED), 0));
        let handle = spawn_engine(config, Fakes { source: Some(source) }, tx).unwrap();

        let mut frames_seen = 0;
        let mut last_state = None;
        while let Some(event) = rx.blocking_recv() {
            match event {
                EngineEvent::Frame(_) => {
                    frames_seen += 1;
                    if frames_seen == 3 {
                        assert!(handle.stop());
                        assert!(!handle.stop());
                    }
                }
                EngineEvent::State(state) => last_state = Some(state),
            }
        }

        assert_eq!(last_state, Some(EngineState::Stopped(StopReason::Cancelled)));
        assert_eq!(handle.join(), StopReason::Cancelled);
    }

    /// Waits for the engine's stop handle while loading the detector, then stops.
    struct StopsWhileLoading {
        inner: Fakes,
        handle: std::sync::mpsc::Receiver<StopHandle>,
    }

    impl Components for StopsWhileLoading {
        fn open_source(&mut self, config: &RecognitionConfig) -> Result<Box<dyn VideoSource>, EngineError> {
            self.inner.open_source(config)
        }

        fn load_detector(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceDetector>, EngineError> {
            let stop = self.handle.recv().unwrap();
            assert!(stop.stop());
            self.inner.load_detector(config)
        }

        fn load_embedder(&mut self, config: &RecognitionConfig) -> Result<Box<dyn FaceEmbedder>, EngineError> {
            self.inner.load_embedder(config)
        }
    }

    #[test]
    fn test_stop_during_start_up_skips_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let components = StopsWhileLoading {
            inner: Fakes { source: Some(Box::new(Endless(image(KNOWN_RED), 0))) },
            handle: handle_rx,
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_engine(config, components, tx).unwrap();
        handle_tx.send(handle.stop_handle()).unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            events.push(event);
        }

        assert_eq!(handle.join(), StopReason::Cancelled);
        assert_eq!(
            states(&events),
            vec![
                EngineState::Initializing,
                EngineState::LoadingModel,
                EngineState::Stopped(StopReason::Cancelled),
            ]
        );
        assert!(updates(&events).is_empty());
    }

    #[test]
    fn test_source_open_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_engine(config, Fakes { source: None }, tx).unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            events.push(event);
        }
        assert!(matches!(handle.join(), StopReason::Error(_)));
        assert!(!states(&events).contains(&EngineState::LoadingModel));
    }
}
