#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use helmet_guard::detect::{BoundingBox, Detection, DetectionResult, Detector};
use helmet_guard::{
    DetectError, EngineContext, EngineSettings, Frame, FrameRead, FrameSource, Notifier,
    ObservationStore, PipelineError, SourceConfig, SourceError, SourceOpener,
};

pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Frame whose first pixel's red channel carries `id`.
pub fn frame_with_id(id: u8) -> Frame {
    Frame::solid(16, 16, [id, 10, 10])
}

#[derive(Clone)]
pub struct Script {
    pub frames: Vec<u8>,
    /// Total frames served before the source goes quiet (`NotReady`).
    pub limit: Option<usize>,
    pub fail_open: bool,
    /// Time each read blocks before returning.
    pub read_delay: Option<Duration>,
}

impl Script {
    pub fn looping(frames: &[u8]) -> Self {
        Self {
            frames: frames.to_vec(),
            limit: None,
            fail_open: false,
            read_delay: None,
        }
    }

    pub fn limited(frames: &[u8], limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::looping(frames)
        }
    }

    pub fn blocking(frames: &[u8], delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::looping(frames)
        }
    }

    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::looping(&[])
        }
    }
}

/// Opener serving scripted sources keyed by identifier, recording every
/// open and close as `open:<id>` / `close:<id>`.
#[derive(Clone, Default)]
pub struct ScriptedOpener {
    scripts: HashMap<String, Script>,
    pub events: EventLog,
    /// Total `read_frame` calls across every source this opener produced.
    pub reads: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, script: Script) -> Self {
        self.scripts.insert(id.to_string(), script);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
        let id = config.identifier().to_string();
        let script = self
            .scripts
            .get(&id)
            .filter(|script| !script.fail_open)
            .cloned()
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("{id} cannot be opened")))?;
        self.events.lock().unwrap().push(format!("open:{id}"));
        Ok(Box::new(ScriptedSource {
            id,
            script,
            position: 0,
            served: 0,
            open: true,
            events: Arc::clone(&self.events),
            reads: Arc::clone(&self.reads),
        }))
    }
}

struct ScriptedSource {
    id: String,
    script: Script,
    position: usize,
    served: usize,
    open: bool,
    events: EventLog,
    reads: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        format!("scripted {}", self.id)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.read_delay {
            thread::sleep(delay);
        }
        if !self.open {
            return Err(SourceError::Closed);
        }
        if self.script.limit.is_some_and(|limit| self.served >= limit) {
            return Ok(FrameRead::NotReady);
        }
        let Some(&id) = self.script.frames.get(self.position) else {
            return Ok(FrameRead::EndOfStream);
        };
        self.position += 1;
        self.served += 1;
        Ok(FrameRead::Frame(frame_with_id(id)))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.position = 0;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.events.lock().unwrap().push(format!("close:{}", self.id));
        }
    }
}

/// Detector keyed on the frame id: ids in `violations` yield a `head` box,
/// ids in `failures` fail, everything else yields a `helmet` box.
pub struct ScriptedDetector {
    pub violations: Vec<u8>,
    pub failures: Vec<u8>,
}

impl ScriptedDetector {
    pub fn new(violations: &[u8], failures: &[u8]) -> Self {
        Self {
            violations: violations.to_vec(),
            failures: failures.to_vec(),
        }
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError> {
        let id = frame.pixel(0, 0).map(|px| px[0]).unwrap_or_default();
        if self.failures.contains(&id) {
            return Err(DetectError::new(format!("cannot classify frame {id}")));
        }
        let label = if self.violations.contains(&id) {
            "head"
        } else {
            "helmet"
        };
        Ok(DetectionResult::new(vec![Detection {
            label: label.to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(4.0, 4.0, 8.0, 8.0),
        }]))
    }
}

/// Notifier that records hand-offs and can be switched to refuse them.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(usize, String)>>,
    pub refuse: AtomicBool,
    pub attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(usize, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Notifier for RecordingNotifier {
    fn send_alert(&self, jpeg: Vec<u8>, destination: &str) -> Result<(), PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PipelineError::NotifierUnavailable("refusing".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((jpeg.len(), destination.to_string()));
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.refuse.load(Ordering::SeqCst)
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        frame_interval: Duration::from_millis(1),
        retry_interval: Duration::from_millis(5),
        error_backoff: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    }
}

pub fn context(
    opener: ScriptedOpener,
    detector: ScriptedDetector,
    notifier: Arc<RecordingNotifier>,
) -> EngineContext {
    EngineContext {
        store: Arc::new(ObservationStore::new(100, "-100123")),
        detector: helmet_guard::detect::shared(detector),
        notifier,
        opener: Arc::new(opener),
        settings: fast_settings(),
    }
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
