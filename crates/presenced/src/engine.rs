//! Recognition loop.
//!
//! Runs on a dedicated OS thread that owns the open camera stream. Each frame
//! goes detector → crop/extract → match → cooldown → attendance state machine,
//! and every step is reported on a broadcast channel. The thread checks a stop
//! flag once per frame and releases the camera on every exit path.

use chrono::NaiveDateTime;
use presence_core::{
    AttendanceOutcome, AttendanceStateMachine, Clock, CooldownGate, CorrelationMatcher, FaceDetector,
    FeatureExtractor, Matcher, Region, TemplateRegistry,
};
use presence_hw::frame::is_dark_frame;
use presence_hw::{CameraError, CameraSource, Frame, FrameStream};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::broadcast;

/// Detector shared between the loop and registration requests.
pub type SharedDetector = Arc<Mutex<Box<dyn FaceDetector>>>;

/// Capacity of the event channel. Slow subscribers lag rather than block the loop.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("recognition thread panicked")]
    Panicked,
}

/// A face seen in a frame, matched or not. Display only; nothing is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Matched identity or `"Unknown"`.
    pub name: String,
    pub confidence: f32,
    pub region: Region,
    pub timestamp: NaiveDateTime,
}

/// An accepted recognition and what it did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub name: String,
    pub outcome: AttendanceOutcome,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    EndOfStream,
    CameraFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::CameraFailed(msg) => write!(f, "camera failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Sighting(Sighting),
    Attendance(AttendanceEvent),
    Stopped(StopReason),
}

/// Everything a loop needs besides the camera. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub registry: Arc<TemplateRegistry>,
    pub detector: SharedDetector,
    pub machine: AttendanceStateMachine,
    pub clock: Arc<dyn Clock>,
    /// Survives loop restarts so a stop/start cannot bypass the cooldown.
    pub gate: Arc<Mutex<CooldownGate>>,
    pub threshold: f32,
    pub dark_fraction: f32,
}

struct RecognitionLoop {
    pipeline: Pipeline,
    events: broadcast::Sender<LoopEvent>,
    frames: u64,
    dark_skipped: u64,
}

impl RecognitionLoop {
    fn run(mut self, mut stream: Box<dyn FrameStream>, stop: &AtomicBool) -> StopReason {
        tracing::info!("recognition thread started");
        let reason = loop {
            if stop.load(Ordering::Acquire) {
                break StopReason::Requested;
            }
            match stream.read() {
                Ok(Some(frame)) => self.process_frame(frame),
                Ok(None) => break StopReason::EndOfStream,
                Err(e) => {
                    tracing::warn!(error = %e, "camera read failed");
                    break StopReason::CameraFailed(e.to_string());
                }
            }
        };
        stream.release();

        tracing::info!(
            %reason,
            frames = self.frames,
            dark_skipped = self.dark_skipped,
            "recognition thread exiting"
        );
        self.emit(LoopEvent::Stopped(reason.clone()));
        reason
    }

    fn process_frame(&mut self, frame: Frame) {
        self.frames += 1;
        if is_dark_frame(&frame.data, self.pipeline.dark_fraction) {
            self.dark_skipped += 1;
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            return;
        }

        let sequence = frame.sequence;
        let Some(image) = frame.into_image() else {
            tracing::warn!(sequence, "frame buffer does not match its dimensions; skipped");
            return;
        };

        let regions = {
            let mut detector = self.pipeline.detector.lock().unwrap_or_else(PoisonError::into_inner);
            match detector.detect(&image) {
                Ok(regions) => regions,
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "detection failed; frame skipped");
                    return;
                }
            }
        };
        if regions.is_empty() {
            return;
        }

        let now = self.pipeline.clock.now();
        let templates = self.pipeline.registry.snapshot();
        for region in regions {
            let descriptor = match FeatureExtractor.extract_region(&image, &region) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::debug!(sequence, ?region, error = %e, "region skipped");
                    continue;
                }
            };
            let result = CorrelationMatcher.best_match(&descriptor, &templates, self.pipeline.threshold);
            tracing::debug!(
                sequence,
                name = result.display_name(),
                confidence = result.confidence,
                "face matched"
            );
            self.emit(LoopEvent::Sighting(Sighting {
                name: result.display_name().to_string(),
                confidence: result.confidence,
                region,
                timestamp: now,
            }));

            if let Some(name) = result.identity {
                self.admit(&name, now);
            }
        }
    }

    /// Gate a recognized identity and apply it to the ledger.
    fn admit(&mut self, name: &str, now: NaiveDateTime) {
        let accepted = self
            .pipeline
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_accept(name, now);
        if !accepted {
            tracing::trace!(name, "within cooldown");
            return;
        }

        match self.pipeline.machine.on_recognized(name, now) {
            Ok(outcome) => self.emit(LoopEvent::Attendance(AttendanceEvent {
                name: name.to_string(),
                outcome,
                timestamp: now,
            })),
            Err(e) => tracing::warn!(name, error = %e, "attendance write failed; event dropped"),
        }
    }

    fn emit(&self, event: LoopEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Running recognition loop.
pub struct LoopHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<StopReason>,
    camera: String,
}

impl LoopHandle {
    /// Ask the loop to stop after the frame it is currently waiting for.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Wait for the thread to exit. Blocks until the current camera read returns.
    pub fn join(self) -> Result<StopReason, EngineError> {
        self.thread.join().map_err(|_| EngineError::Panicked)
    }

    pub fn shutdown(self) -> Result<StopReason, EngineError> {
        self.stop();
        self.join()
    }
}

/// Open `camera` and start a recognition loop on its own thread.
///
/// Camera open failures are returned here rather than from the thread.
pub fn spawn(
    camera: &mut dyn CameraSource,
    pipeline: Pipeline,
    events: broadcast::Sender<LoopEvent>,
) -> Result<LoopHandle, EngineError> {
    let description = camera.describe();
    let stream = camera.open()?;
    tracing::info!(
        camera = %description,
        threshold = pipeline.threshold,
        identities = pipeline.registry.len(),
        "camera opened; starting recognition loop"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let worker = RecognitionLoop {
        pipeline,
        events,
        frames: 0,
        dark_skipped: 0,
    };
    // On spawn failure the closure, and with it the stream, is dropped and released.
    let thread = std::thread::Builder::new()
        .name("presence-recognition".into())
        .spawn(move || worker.run(stream, &flag))
        .map_err(EngineError::Spawn)?;

    Ok(LoopHandle {
        stop,
        thread,
        camera: description,
    })
}

/// Start/stop control over at most one running loop.
pub struct LoopController {
    pipeline: Pipeline,
    events: broadcast::Sender<LoopEvent>,
    running: Mutex<Option<LoopHandle>>,
}

impl LoopController {
    pub fn new(pipeline: Pipeline, events: broadcast::Sender<LoopEvent>) -> Self {
        Self {
            pipeline,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    /// Start a loop on `camera`. Returns `false` if one is already running.
    pub fn start(&self, camera: &mut dyn CameraSource) -> Result<bool, EngineError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }
        if let Some(finished) = running.take() {
            match finished.join() {
                Ok(reason) => tracing::debug!(%reason, "previous recognition loop reaped"),
                Err(e) => tracing::warn!(error = %e, "previous recognition loop"),
            }
        }
        *running = Some(spawn(camera, self.pipeline.clone(), self.events.clone())?);
        Ok(true)
    }

    /// Stop the running loop and wait for it. `None` if nothing was running.
    pub fn stop(&self) -> Result<Option<StopReason>, EngineError> {
        let handle = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => handle.shutdown().map(Some),
            None => Ok(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Camera of the running loop, if any.
    pub fn camera(&self) -> Option<String> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|h| !h.is_finished())
            .map(|h| h.camera().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use presence_core::features::HISTOGRAM_BINS;
    use presence_core::{
        DayStatus, FullFrameDetector, Ledger, LedgerError, MemoryLedger, RecordQuery, UNKNOWN_IDENTITY,
    };
    use image::{GrayImage, Luma};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ALICE: u8 = 100;
    const BOB: u8 = 200;
    const STRANGER: u8 = 150;

    fn face(level: u8) -> GrayImage {
        GrayImage::from_pixel(40, 40, Luma([level]))
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 4).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    /// Hands out the queued times in order, repeating the last one.
    struct ScriptedClock(Mutex<VecDeque<NaiveDateTime>>);

    impl Clock for ScriptedClock {
        fn now(&self) -> NaiveDateTime {
            let mut times = self.0.lock().unwrap();
            if times.len() > 1 {
                times.pop_front().unwrap()
            } else {
                *times.front().unwrap()
            }
        }
    }

    #[derive(Clone, Default)]
    struct Probe {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    enum Script {
        Frame(GrayImage),
        Fail,
        /// Wait until the test lets the stream continue.
        Hold(std::sync::mpsc::Receiver<()>),
    }

    struct ScriptedSource {
        script: Option<Vec<Script>>,
        probe: Probe,
        endless: bool,
    }

    struct ScriptedStream {
        script: VecDeque<Script>,
        probe: Probe,
        endless: bool,
        released: bool,
        sequence: u32,
    }

    impl CameraSource for ScriptedSource {
        fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
            let script = self.script.take().ok_or(CameraError::DeviceBusy)?;
            self.probe.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedStream {
                script: script.into(),
                probe: self.probe.clone(),
                endless: self.endless,
                released: false,
                sequence: 0,
            }))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    impl FrameStream for ScriptedStream {
        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            self.sequence += 1;
            match self.script.pop_front() {
                Some(Script::Frame(image)) => Ok(Some(Frame::from_image(image, self.sequence))),
                Some(Script::Fail) => Err(CameraError::CaptureFailed("cable pulled".into())),
                Some(Script::Hold(rx)) => {
                    let _ = rx.recv();
                    Ok(Some(Frame::from_image(face(STRANGER), self.sequence)))
                }
                None if self.endless => {
                    std::thread::sleep(Duration::from_millis(2));
                    Ok(Some(Frame::from_image(face(STRANGER), self.sequence)))
                }
                None => Ok(None),
            }
        }

        fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.probe.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for ScriptedStream {
        fn drop(&mut self) {
            self.release();
        }
    }

    fn source(script: Vec<Script>) -> (ScriptedSource, Probe) {
        let probe = Probe::default();
        (
            ScriptedSource {
                script: Some(script),
                probe: probe.clone(),
                endless: false,
            },
            probe,
        )
    }

    fn pipeline(ledger: Arc<dyn Ledger>, times: Vec<NaiveDateTime>) -> Pipeline {
        let registry = TemplateRegistry::empty("unused.json", HISTOGRAM_BINS);
        registry.upsert("alice", FeatureExtractor.extract(&face(ALICE)).unwrap()).unwrap();
        registry.upsert("bob", FeatureExtractor.extract(&face(BOB)).unwrap()).unwrap();
        Pipeline {
            registry: Arc::new(registry),
            detector: Arc::new(Mutex::new(Box::new(FullFrameDetector) as Box<dyn FaceDetector>)),
            machine: AttendanceStateMachine::new(ledger),
            clock: Arc::new(ScriptedClock(Mutex::new(times.into()))),
            gate: Arc::new(Mutex::new(CooldownGate::new(chrono::Duration::seconds(15)))),
            threshold: 0.6,
            dark_fraction: presence_hw::frame::DARK_FRACTION,
        }
    }

    fn run_to_end(
        script: Vec<Script>,
        ledger: Arc<dyn Ledger>,
        times: Vec<NaiveDateTime>,
    ) -> (StopReason, Vec<LoopEvent>, Probe) {
        run_pipeline(script, pipeline(ledger, times))
    }

    fn run_pipeline(script: Vec<Script>, pipeline: Pipeline) -> (StopReason, Vec<LoopEvent>, Probe) {
        let (mut camera, probe) = source(script);
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let handle = spawn(&mut camera, pipeline, tx).unwrap();
        let reason = handle.join().unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (reason, events, probe)
    }

    fn attendance(events: &[LoopEvent]) -> Vec<&AttendanceEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Attendance(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_check_in_cooldown_then_check_out() {
        let ledger = Arc::new(MemoryLedger::new());
        let script = vec![
            Script::Frame(face(ALICE)),
            Script::Frame(face(ALICE)),
            Script::Frame(face(ALICE)),
        ];
        let (reason, events, probe) =
            run_to_end(script, ledger.clone(), vec![at(9, 0, 0), at(9, 0, 5), at(9, 15, 0)]);

        assert_eq!(reason, StopReason::EndOfStream);
        assert_eq!(probe.released.load(Ordering::SeqCst), 1);

        let sightings = events.iter().filter(|e| matches!(e, LoopEvent::Sighting(_))).count();
        assert_eq!(sightings, 3);

        let accepted = attendance(&events);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].outcome, AttendanceOutcome::CheckedIn { time_in: at(9, 0, 0) });
        assert_eq!(
            accepted[1].outcome,
            AttendanceOutcome::CheckedOut { time_in: at(9, 0, 0).time(), time_out: at(9, 15, 0) }
        );
        assert_eq!(events.last(), Some(&LoopEvent::Stopped(StopReason::EndOfStream)));

        assert_eq!(
            ledger.status("alice", at(9, 0, 0).date()).unwrap(),
            DayStatus::CheckedOut { time_in: at(9, 0, 0).time(), time_out: at(9, 15, 0).time() }
        );
    }

    #[test]
    fn test_unknown_face_writes_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, events, _) = run_to_end(vec![Script::Frame(face(STRANGER))], ledger.clone(), vec![at(9, 0, 0)]);

        match &events[0] {
            LoopEvent::Sighting(s) => {
                assert_eq!(s.name, UNKNOWN_IDENTITY);
                assert!(s.confidence < 0.6);
                assert_eq!(s.region, Region::new(0, 0, 40, 40));
            }
            other => panic!("expected sighting, got {other:?}"),
        }
        assert!(attendance(&events).is_empty());
        assert!(ledger.query(&RecordQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_dark_frames_skipped() {
        let ledger = Arc::new(MemoryLedger::new());
        let script = vec![Script::Frame(face(5)), Script::Frame(face(BOB))];
        let (_, events, _) = run_to_end(script, ledger, vec![at(9, 0, 0)]);

        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Sighting(s) => Some(s.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[test]
    fn test_dark_fraction_is_configurable() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut pipeline = pipeline(ledger, vec![at(9, 0, 0)]);
        // Every pixel is near black, but never more than all of them.
        pipeline.dark_fraction = 1.0;
        let (_, events, _) = run_pipeline(vec![Script::Frame(face(5))], pipeline);

        let sightings = events.iter().filter(|e| matches!(e, LoopEvent::Sighting(_))).count();
        assert_eq!(sightings, 1);
    }

    #[test]
    fn test_camera_failure_ends_loop_and_releases() {
        let ledger = Arc::new(MemoryLedger::new());
        let script = vec![Script::Frame(face(ALICE)), Script::Fail, Script::Frame(face(BOB))];
        let (reason, events, probe) = run_to_end(script, ledger, vec![at(9, 0, 0)]);

        assert!(matches!(reason, StopReason::CameraFailed(ref msg) if msg.contains("cable pulled")));
        assert_eq!(probe.released.load(Ordering::SeqCst), 1);
        assert_eq!(attendance(&events).len(), 1);
        assert!(!events.iter().any(|e| matches!(e, LoopEvent::Sighting(s) if s.name == "bob")));
    }

    /// Fails every write.
    struct BrokenLedger;

    impl Ledger for BrokenLedger {
        fn status(&self, _: &str, _: NaiveDate) -> Result<DayStatus, LedgerError> {
            Ok(DayStatus::NotPresent)
        }
        fn open_record(&self, _: &str, _: NaiveDateTime) -> Result<(), LedgerError> {
            Err(LedgerError::storage(std::io::Error::other("disk full")))
        }
        fn close_record(&self, _: &str, _: NaiveDateTime) -> Result<(), LedgerError> {
            Err(LedgerError::storage(std::io::Error::other("disk full")))
        }
        fn query(&self, _: &RecordQuery) -> Result<Vec<presence_core::AttendanceDayRecord>, LedgerError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_ledger_failure_keeps_running() {
        let script = vec![Script::Frame(face(ALICE)), Script::Frame(face(BOB))];
        let (reason, events, _) = run_to_end(script, Arc::new(BrokenLedger), vec![at(9, 0, 0)]);

        assert_eq!(reason, StopReason::EndOfStream);
        assert!(attendance(&events).is_empty());
        let sightings = events.iter().filter(|e| matches!(e, LoopEvent::Sighting(_))).count();
        assert_eq!(sightings, 2);
    }

    #[test]
    fn test_stop_flag_releases_camera() {
        let (hold_tx, hold_rx) = std::sync::mpsc::channel();
        let (mut camera, probe) = source(vec![Script::Hold(hold_rx)]);
        camera.endless = true;
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        let handle = spawn(&mut camera, pipeline(Arc::new(MemoryLedger::new()), vec![at(9, 0, 0)]), tx).unwrap();

        handle.stop();
        // The thread may already have exited and dropped the receiver.
        let _ = hold_tx.send(());
        assert_eq!(handle.join().unwrap(), StopReason::Requested);
        assert_eq!(probe.opened.load(Ordering::SeqCst), 1);
        assert_eq!(probe.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_reported_to_caller() {
        let (mut camera, _) = source(Vec::new());
        camera.script = None;
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        let err = spawn(&mut camera, pipeline(Arc::new(MemoryLedger::new()), vec![at(9, 0, 0)]), tx).err();
        assert!(matches!(err, Some(EngineError::Camera(CameraError::DeviceBusy))));
    }

    #[test]
    fn test_controller_single_loop_and_gate_survives_restart() {
        let ledger = Arc::new(MemoryLedger::new());
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let controller = LoopController::new(pipeline(ledger.clone(), vec![at(9, 0, 0), at(9, 0, 10)]), tx);

        let (mut first, _) = source(vec![Script::Frame(face(ALICE))]);
        first.endless = true;
        assert!(controller.start(&mut first).unwrap());
        assert!(controller.is_running());
        assert_eq!(controller.camera().as_deref(), Some("scripted"));

        let (mut second, _) = source(Vec::new());
        assert!(!controller.start(&mut second).unwrap());

        assert_eq!(controller.stop().unwrap(), Some(StopReason::Requested));
        assert!(!controller.is_running());
        assert_eq!(controller.stop().unwrap(), None);

        // 09:00:10 is still inside alice's cooldown from 09:00:00.
        let (mut third, _) = source(vec![Script::Frame(face(ALICE))]);
        assert!(controller.start(&mut third).unwrap());
        while controller.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut accepted = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LoopEvent::Attendance(_)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(ledger.query(&RecordQuery::default()).unwrap().len(), 1);
    }
}
