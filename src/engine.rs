//! The capture → detect → annotate → publish → notify loop.
//!
//! One `PipelineEngine` owns one background thread reading from one source.
//! Changing the source means stopping the engine and starting a new one; an
//! engine never switches sources in place.
//!
//! Only `PipelineEngine::start` reports failures to its caller. Everything
//! that goes wrong inside the loop is logged to the `ObservationStore` and the
//! loop keeps running.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::{DetectionResult, SharedDetector};
use crate::error::{PipelineError, SourceError};
use crate::frame::{EncodedFrame, Frame, DEFAULT_JPEG_QUALITY, MAX_FRAME_WIDTH};
use crate::ingest::{FrameRead, FrameSource, SourceConfig, SourceOpener};
use crate::notify::{Cooldown, SharedNotifier, DEFAULT_COOLDOWN};
use crate::store::{lock, LogLevel, ObservationStore};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Tunables for the pipeline loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Label whose presence in a frame counts as a violation.
    pub target_class: String,
    pub cooldown: Duration,
    pub max_frame_width: u32,
    pub jpeg_quality: u8,
    /// Pause after each processed frame.
    pub frame_interval: Duration,
    /// Pause before reopening an unavailable source.
    pub retry_interval: Duration,
    /// Pause after an iteration failed.
    pub error_backoff: Duration,
    /// How long `stop` waits for the loop thread.
    pub stop_timeout: Duration,
    /// Detection failures and consecutive refused alerts reach the operator
    /// log once per this many.
    pub detection_log_every: u64,
    pub heartbeat_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            target_class: "head".to_string(),
            cooldown: DEFAULT_COOLDOWN,
            max_frame_width: MAX_FRAME_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            frame_interval: Duration::from_millis(33),
            retry_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            detection_log_every: 100,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Collaborators shared by every engine generation.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<ObservationStore>,
    pub detector: SharedDetector,
    pub notifier: SharedNotifier,
    pub opener: Arc<dyn SourceOpener>,
    pub settings: EngineSettings,
}

type SourceSlot = Arc<Mutex<Option<Box<dyn FrameSource>>>>;

pub struct PipelineEngine {
    source_config: SourceConfig,
    store: Arc<ObservationStore>,
    stop: Arc<AtomicBool>,
    detection_active: Arc<AtomicBool>,
    source: SourceSlot,
    handle: Option<JoinHandle<()>>,
    done: Option<mpsc::Receiver<()>>,
    stop_timeout: Duration,
    stopped: bool,
}

impl PipelineEngine {
    /// Open `source_config` and spawn the loop thread.
    ///
    /// Fails with `SourceUnavailable` when the source cannot be opened; the
    /// failure is also written to the operator log.
    pub fn start(
        source_config: SourceConfig,
        ctx: EngineContext,
        detection_active: bool,
    ) -> Result<Self, PipelineError> {
        let store = Arc::clone(&ctx.store);
        store.set_detection_active(detection_active);

        let source = match ctx.opener.open(&source_config) {
            Ok(source) => source,
            Err(err) => {
                store.set_camera_active(false);
                store.append_log(
                    LogLevel::Error,
                    format!("failed to start camera ({source_config}): {err}"),
                );
                return Err(match err {
                    PipelineError::SourceUnavailable(_) => err,
                    other => PipelineError::SourceUnavailable(other.to_string()),
                });
            }
        };
        let description = source.describe();
        store.set_camera_active(true);

        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(detection_active));
        let slot: SourceSlot = Arc::new(Mutex::new(Some(source)));
        let (done_tx, done_rx) = mpsc::channel();
        let stop_timeout = ctx.settings.stop_timeout;

        let worker = Worker {
            cooldown: Cooldown::new(ctx.settings.cooldown),
            ctx,
            config: source_config.clone(),
            stop: Arc::clone(&stop),
            detection_active: Arc::clone(&active),
            source: Arc::clone(&slot),
            frames: 0,
            detect_failures: 0,
            refused_alerts: 0,
            last_heartbeat: Instant::now(),
        };
        let handle = thread::Builder::new()
            .name("helmet-pipeline".to_string())
            .spawn(move || worker.run(done_tx))
            .map_err(|err| {
                if let Some(mut source) = lock(&slot).take() {
                    source.close();
                }
                store.set_camera_active(false);
                PipelineError::SourceUnavailable(format!("failed to spawn pipeline thread: {err}"))
            })?;

        store.append_log(
            LogLevel::System,
            format!("camera started - source: {description}"),
        );

        Ok(Self {
            source_config,
            store,
            stop,
            detection_active: active,
            source: slot,
            handle: Some(handle),
            done: Some(done_rx),
            stop_timeout,
            stopped: false,
        })
    }

    pub fn source_config(&self) -> &SourceConfig {
        &self.source_config
    }

    /// Flip violation accounting on or off. Returns the new state.
    pub fn toggle_detection(&self) -> bool {
        let active = !self.detection_active.fetch_xor(true, Ordering::SeqCst);
        self.store.set_detection_active(active);
        let state = if active { "enabled" } else { "disabled" };
        self.store
            .append_log(LogLevel::System, format!("detection {state}"));
        active
    }

    pub fn detection_active(&self) -> bool {
        self.detection_active.load(Ordering::SeqCst)
    }

    pub fn camera_active(&self) -> bool {
        !self.stopped && self.store.camera_active()
    }

    /// True once no source is held by this engine. Stays false after a
    /// `stop` that had to detach a loop thread still blocked in a read.
    pub fn source_released(&self) -> bool {
        self.source
            .try_lock()
            .map(|slot| slot.is_none())
            .unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and release the source. Idempotent.
    ///
    /// Waits up to the configured stop timeout for the loop thread; a thread
    /// that does not exit in time is detached and closes the source itself
    /// when it finally does.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop.store(true, Ordering::SeqCst);

        let exited = match self.done.take() {
            Some(done) => !matches!(
                done.recv_timeout(self.stop_timeout),
                Err(RecvTimeoutError::Timeout)
            ),
            None => true,
        };
        if let Some(handle) = self.handle.take() {
            if exited {
                if handle.join().is_err() {
                    log::error!("pipeline thread panicked");
                }
            } else {
                log::warn!(
                    "pipeline thread did not exit within {:?}; detaching",
                    self.stop_timeout
                );
            }
        }

        if let Ok(mut slot) = self.source.try_lock() {
            if let Some(mut source) = slot.take() {
                source.close();
            }
        }
        self.store.set_camera_active(false);
        self.store.append_log(LogLevel::System, "pipeline stopped");
    }
}

impl Drop for PipelineEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    ctx: EngineContext,
    config: SourceConfig,
    stop: Arc<AtomicBool>,
    detection_active: Arc<AtomicBool>,
    source: SourceSlot,
    cooldown: Cooldown,
    frames: u64,
    detect_failures: u64,
    refused_alerts: u64,
    last_heartbeat: Instant,
}

impl Worker {
    fn run(mut self, done: Sender<()>) {
        log::info!("pipeline loop started for {}", self.config);
        while !self.stop.load(Ordering::SeqCst) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.step()));
            let pause = match outcome {
                Ok(Ok(pause)) => pause,
                Ok(Err(err)) => {
                    self.ctx
                        .store
                        .append_log(LogLevel::Error, format!("pipeline error: {err}"));
                    self.ctx.settings.error_backoff
                }
                Err(_) => {
                    self.ctx
                        .store
                        .append_log(LogLevel::Error, "pipeline iteration panicked");
                    self.ctx.settings.error_backoff
                }
            };
            self.sleep(pause);
        }

        if let Some(mut source) = lock(&self.source).take() {
            source.close();
        }
        log::info!(
            "pipeline loop for {} exited after {} frames",
            self.config,
            self.frames
        );
        let _ = done.send(());
    }

    /// One iteration. Returns how long to pause before the next.
    fn step(&mut self) -> Result<Duration, PipelineError> {
        let read = {
            let mut slot = lock(&self.source);
            match slot.as_mut() {
                Some(source) if source.is_open() => Some(source.read_frame()),
                _ => None,
            }
        };
        let Some(read) = read else {
            return Ok(self.reopen());
        };

        let frame = match read {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::NotReady) => return Ok(self.ctx.settings.frame_interval),
            Ok(FrameRead::EndOfStream) => {
                self.rewind_or_drop();
                return Ok(self.ctx.settings.frame_interval);
            }
            Err(SourceError::Closed) => {
                self.drop_source();
                return Ok(self.ctx.settings.retry_interval);
            }
            Err(err) => {
                log::warn!("read from {} failed: {}", self.config, err);
                self.ctx
                    .store
                    .append_log(LogLevel::Error, format!("camera read failed: {err}"));
                self.drop_source();
                return Ok(self.ctx.settings.retry_interval);
            }
        };

        self.process(frame);
        Ok(self.ctx.settings.frame_interval)
    }

    fn process(&mut self, frame: Frame) {
        let settings = &self.ctx.settings;
        let store = &self.ctx.store;
        let frame = frame.downscale_to_width(settings.max_frame_width);
        self.frames += 1;

        let active = self.detection_active.load(Ordering::SeqCst);
        let (display, violation) = match self.detect(&frame) {
            Ok((annotated, result)) => {
                let violation = active && result.contains_class(&settings.target_class);
                if active {
                    store.record_detection();
                    if violation {
                        store.record_violation();
                    }
                }
                (annotated, violation)
            }
            Err(err) => {
                self.detect_failures += 1;
                log::warn!("detection failed on frame {}: {}", self.frames, err);
                let every = settings.detection_log_every.max(1);
                if (self.detect_failures - 1) % every == 0 {
                    store.append_log(LogLevel::Error, format!("detection error: {err}"));
                }
                (frame, false)
            }
        };

        match EncodedFrame::encode(&display, settings.jpeg_quality) {
            Ok(encoded) => {
                store.publish_frame(encoded.base64, violation);
                if violation {
                    self.dispatch(encoded.jpeg);
                }
            }
            Err(err) => log::warn!("frame {} skipped: {}", self.frames, err),
        }

        if self.last_heartbeat.elapsed() > self.ctx.settings.heartbeat_interval {
            self.last_heartbeat = Instant::now();
            self.ctx.store.append_log(
                LogLevel::System,
                format!("system running - frame {}", self.frames),
            );
        }
    }

    fn detect(&self, frame: &Frame) -> Result<(Frame, DetectionResult), PipelineError> {
        let mut detector = lock(&self.ctx.detector);
        let result = detector.detect(frame)?;
        let annotated = detector.annotate(frame, &result);
        Ok((annotated, result))
    }

    /// Cooldown-gated hand-off of an alert.
    fn dispatch(&mut self, jpeg: Vec<u8>) {
        let now = Instant::now();
        if !self.cooldown.ready(now) {
            return;
        }
        let store = &self.ctx.store;
        let destination = store.destination();
        match self.ctx.notifier.send_alert(jpeg, &destination) {
            Ok(()) => {
                self.cooldown.mark(now);
                self.refused_alerts = 0;
                store.record_notification();
                store.append_log(
                    LogLevel::Notification,
                    format!("alert sent to chat {destination}"),
                );
            }
            Err(err) => {
                self.refused_alerts += 1;
                log::debug!("alert not sent ({} in a row): {}", self.refused_alerts, err);
                let every = self.ctx.settings.detection_log_every.max(1);
                if (self.refused_alerts - 1) % every == 0 {
                    store.append_log(LogLevel::Error, format!("alert not sent: {err}"));
                }
            }
        }
    }

    fn reopen(&mut self) -> Duration {
        let store = &self.ctx.store;
        match self.ctx.opener.open(&self.config) {
            Ok(source) => {
                let description = source.describe();
                *lock(&self.source) = Some(source);
                store.set_camera_active(true);
                store.append_log(
                    LogLevel::System,
                    format!("camera reconnected - source: {description}"),
                );
                Duration::ZERO
            }
            Err(err) => {
                if store.camera_active() {
                    store.append_log(LogLevel::Error, format!("camera unavailable: {err}"));
                }
                store.set_camera_active(false);
                self.ctx.settings.retry_interval
            }
        }
    }

    fn rewind_or_drop(&mut self) {
        let mut slot = lock(&self.source);
        let Some(source) = slot.as_mut() else {
            return;
        };
        if !source.is_finite() {
            return;
        }
        if let Err(err) = source.rewind() {
            log::warn!("rewind of {} failed: {}", self.config, err);
            source.close();
            *slot = None;
        }
    }

    fn drop_source(&mut self) {
        if let Some(mut source) = lock(&self.source).take() {
            source.close();
        }
        self.ctx.store.set_camera_active(false);
    }

    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{shared, StubBackend};
    use crate::ingest::DefaultSourceOpener;
    use crate::notify::DisabledNotifier;

    fn context(store: Arc<ObservationStore>) -> EngineContext {
        EngineContext {
            store,
            detector: shared(StubBackend::new("head")),
            notifier: Arc::new(DisabledNotifier),
            opener: Arc::new(DefaultSourceOpener::default()),
            settings: EngineSettings {
                frame_interval: Duration::from_millis(1),
                ..EngineSettings::default()
            },
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_fails_for_unavailable_source() {
        let store = Arc::new(ObservationStore::default());
        let err = PipelineEngine::start(
            SourceConfig::file("http://example.com/a.mp4"),
            context(Arc::clone(&store)),
            true,
        )
        .err()
        .expect("remote file must not open");
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
        assert!(!store.camera_active());
        assert_eq!(store.logs()[0].level, LogLevel::Error);
    }

    #[test]
    fn stub_clip_publishes_frames_and_violations() {
        let store = Arc::new(ObservationStore::default());
        let mut engine = PipelineEngine::start(
            SourceConfig::file("stub://clip?frames=4&marker_every=2"),
            context(Arc::clone(&store)),
            true,
        )
        .unwrap();
        assert!(engine.camera_active());
        assert!(wait_for(|| store.stats().violations_detected >= 2));
        assert!(store.frame().is_some());

        engine.stop();
        engine.stop();
        assert!(!engine.camera_active());
        let stops = store
            .logs()
            .iter()
            .filter(|entry| entry.message == "pipeline stopped")
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn toggle_flips_and_logs() {
        let store = Arc::new(ObservationStore::default());
        let engine = PipelineEngine::start(
            SourceConfig::Device {
                device: "stub://cam".to_string(),
            },
            context(Arc::clone(&store)),
            false,
        )
        .unwrap();
        assert!(!engine.detection_active());
        assert!(engine.toggle_detection());
        assert!(store.detection_active());
        assert!(!engine.toggle_detection());
        assert!(store
            .logs()
            .iter()
            .any(|entry| entry.message == "detection disabled"));
    }
}
