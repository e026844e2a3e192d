//! Application context shared by the binary and the control surface.
//!
//! `Monitor` owns the current pipeline generation together with the
//! long-lived collaborators (store, detector, notifier, source opener,
//! config writer). Source changes are serialized by the generation lock and
//! always stop the old engine before the new one opens its source.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::config::{config_writer, is_valid_chat_id, AppConfig, ConfigWriter};
use crate::detect::{build_detector, SharedDetector};
use crate::engine::{EngineContext, EngineSettings, PipelineEngine};
use crate::error::{MonitorError, PipelineError};
use crate::frame::decode_base64_jpeg;
use crate::ingest::{
    list_devices, list_media_files, DefaultSourceOpener, FrameRead, SourceConfig, SourceOpener,
};
use crate::notify::{build_notifier, SharedNotifier};
use crate::store::{lock, LogEntry, LogLevel, ObservationStore, Stats};

const CHECK_ATTEMPTS: u32 = 50;
const CHECK_WAIT: Duration = Duration::from_millis(20);

struct Generation {
    engine: Option<PipelineEngine>,
    source: SourceConfig,
}

/// Entry of the selectable source list.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceEntry {
    pub source: SourceConfig,
    pub label: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceListing {
    pub active: SourceConfig,
    pub sources: Vec<SourceEntry>,
}

/// Result of probing a source.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SourceCheck {
    pub width: u32,
    pub height: u32,
}

pub struct Monitor {
    ctx: EngineContext,
    generation: Mutex<Generation>,
    writer: Mutex<Box<dyn ConfigWriter>>,
    media_dir: PathBuf,
}

impl Monitor {
    pub fn new(
        ctx: EngineContext,
        source: SourceConfig,
        writer: Box<dyn ConfigWriter>,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            generation: Mutex::new(Generation {
                engine: None,
                source,
            }),
            writer: Mutex::new(writer),
            media_dir: media_dir.into(),
        }
    }

    /// Wire up the default collaborators for `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(ObservationStore::new(
            config.log_capacity,
            config.notifier.chat_id.clone(),
        ));
        store.set_detection_active(config.detector.active_on_start);
        let detector: SharedDetector = build_detector(&config.detector)?;
        let notifier: SharedNotifier = build_notifier(config.telegram())?;
        let ctx = EngineContext {
            store,
            detector,
            notifier,
            opener: Arc::new(DefaultSourceOpener::default()),
            settings: config.engine_settings(),
        };
        Ok(Self::new(
            ctx,
            config.source.clone(),
            config_writer(config),
            config.media_dir.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<ObservationStore> {
        &self.ctx.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    /// Start the first generation from the configured source. A running
    /// engine is left alone.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut generation = lock(&self.generation);
        if generation.engine.is_some() {
            return Ok(());
        }
        let engine = self.start_engine(generation.source.clone())?;
        generation.engine = Some(engine);
        Ok(())
    }

    fn start_engine(&self, source: SourceConfig) -> Result<PipelineEngine, PipelineError> {
        PipelineEngine::start(source, self.ctx.clone(), self.ctx.store.detection_active())
    }

    /// Stop the current engine, then start one on `source`.
    ///
    /// On failure no engine is running and the previous source stays the
    /// recorded active one. If the old loop thread is stuck in a read past the
    /// stop timeout, the new source is not opened; a later retry succeeds once
    /// that read returns and the old source is closed.
    pub fn change_source(&self, source: SourceConfig) -> Result<(), PipelineError> {
        let mut generation = lock(&self.generation);
        if let Some(mut engine) = generation.engine.take() {
            engine.stop();
            if !engine.source_released() {
                let message = format!(
                    "previous source {} is still held by a stalled read; not opening {source}",
                    engine.source_config()
                );
                self.ctx.store.append_log(LogLevel::Error, message.clone());
                return Err(PipelineError::SourceUnavailable(message));
            }
        }
        self.ctx
            .store
            .append_log(LogLevel::Config, format!("switching source to {source}"));

        let engine = self.start_engine(source.clone())?;
        generation.engine = Some(engine);
        generation.source = source.clone();
        drop(generation);

        if let Err(err) = lock(&self.writer).set_active_source(&source) {
            self.ctx.store.append_log(
                LogLevel::Error,
                format!("failed to persist source {source}: {err:#}"),
            );
        }
        Ok(())
    }

    pub fn active_source(&self) -> SourceConfig {
        lock(&self.generation).source.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.generation)
            .engine
            .as_ref()
            .map(PipelineEngine::is_running)
            .unwrap_or(false)
    }

    /// Flip violation accounting. With no engine running the flag is stored
    /// and picked up by the next generation.
    pub fn toggle_detection(&self) -> bool {
        let generation = lock(&self.generation);
        match generation.engine.as_ref() {
            Some(engine) => engine.toggle_detection(),
            None => {
                let store = &self.ctx.store;
                let active = !store.detection_active();
                store.set_detection_active(active);
                let state = if active { "enabled" } else { "disabled" };
                store.append_log(LogLevel::System, format!("detection {state}"));
                active
            }
        }
    }

    pub fn detection_active(&self) -> bool {
        self.ctx.store.detection_active()
    }

    /// Validate, persist and apply a new alert destination. Returns the
    /// normalized chat id.
    pub fn set_destination(&self, chat_id: &str) -> Result<String, MonitorError> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(MonitorError::InvalidInput("chat id is required".to_string()));
        }
        if !is_valid_chat_id(chat_id) {
            return Err(MonitorError::InvalidInput(format!(
                "chat id '{chat_id}' must be numeric or an @channel name"
            )));
        }
        lock(&self.writer)
            .set_active_destination(chat_id)
            .map_err(|err| MonitorError::Config(format!("{err:#}")))?;
        let previous = self.ctx.store.set_destination(chat_id);
        self.ctx.store.append_log(
            LogLevel::Config,
            format!("chat id updated: {previous} -> {chat_id}"),
        );
        Ok(chat_id.to_string())
    }

    /// Send the latest published frame to the current destination, bypassing
    /// the cooldown.
    pub fn send_test_notification(&self) -> Result<(), MonitorError> {
        let store = &self.ctx.store;
        let (encoded, _) = store.frame().ok_or(MonitorError::NoFrame)?;
        let jpeg = decode_base64_jpeg(&encoded)?;
        let destination = store.destination();
        match self.ctx.notifier.send_alert(jpeg, &destination) {
            Ok(()) => {
                store.record_notification();
                store.append_log(
                    LogLevel::Notification,
                    format!("test notification sent to chat {destination}"),
                );
                Ok(())
            }
            Err(err) => {
                store.append_log(
                    LogLevel::Error,
                    format!("test notification failed: {err}"),
                );
                Err(err.into())
            }
        }
    }

    /// Devices and media files that can be selected, plus the active source.
    pub fn list_sources(&self) -> SourceListing {
        let active = self.active_source();
        let mut sources: Vec<SourceEntry> = list_devices()
            .into_iter()
            .chain(list_media_files(&self.media_dir))
            .map(|source| entry(source, &active))
            .collect();
        if !sources.iter().any(|entry| entry.active) {
            sources.insert(0, entry(active.clone(), &active));
        }
        SourceListing { active, sources }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Open `source`, read one frame and close it again.
    ///
    /// The running source is not reopened; its latest published frame is
    /// reported instead.
    pub fn test_source(&self, source: &SourceConfig) -> Result<SourceCheck, MonitorError> {
        if source == &self.active_source() && self.is_running() {
            let (encoded, _) = self.ctx.store.frame().ok_or(MonitorError::NoFrame)?;
            let jpeg = decode_base64_jpeg(&encoded)?;
            let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
                .map_err(|err| PipelineError::EncodingFailure(err.to_string()))?;
            return Ok(SourceCheck {
                width: image.width(),
                height: image.height(),
            });
        }
        check_source(self.ctx.opener.as_ref(), source).map_err(MonitorError::from)
    }

    pub fn frame(&self) -> Option<(String, bool)> {
        self.ctx.store.frame()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.ctx.store.logs()
    }

    pub fn stats(&self) -> Stats {
        self.ctx.store.stats()
    }

    /// Stop the running engine and the notifier's delivery threads.
    pub fn shutdown(&self) {
        if let Some(mut engine) = lock(&self.generation).engine.take() {
            engine.stop();
        }
        self.ctx.notifier.shutdown();
    }
}

fn entry(source: SourceConfig, active: &SourceConfig) -> SourceEntry {
    let label = match &source {
        SourceConfig::Device { device } => format!("camera {device}"),
        SourceConfig::File { path } => Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone()),
    };
    SourceEntry {
        active: &source == active,
        source,
        label,
    }
}

fn check_source(
    opener: &dyn SourceOpener,
    config: &SourceConfig,
) -> Result<SourceCheck, PipelineError> {
    let mut source = opener.open(config)?;
    let mut outcome = Err(PipelineError::SourceUnavailable(format!(
        "{config}: no frame within {} attempts",
        CHECK_ATTEMPTS
    )));
    for _ in 0..CHECK_ATTEMPTS {
        match source.read_frame() {
            Ok(FrameRead::Frame(frame)) => {
                outcome = Ok(SourceCheck {
                    width: frame.width(),
                    height: frame.height(),
                });
                break;
            }
            Ok(FrameRead::NotReady) => thread::sleep(CHECK_WAIT),
            Ok(FrameRead::EndOfStream) => {
                outcome = Err(PipelineError::SourceUnavailable(format!(
                    "{config}: source contains no frames"
                )));
                break;
            }
            Err(err) => {
                outcome = Err(PipelineError::SourceUnavailable(format!("{config}: {err}")));
                break;
            }
        }
    }
    source.close();
    outcome
}
