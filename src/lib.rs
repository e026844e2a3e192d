//! Helmet compliance monitor.
//!
//! This crate runs an object detector over a live video stream, flags frames
//! that contain a configured violation class (e.g. `head`, a person without a
//! helmet) and hands throttled alerts with the annotated frame to a chat bot.
//!
//! # Architecture
//!
//! - `ingest`: frame sources (camera devices, looping files, synthetic `stub://`)
//! - `detect`: detector backends and box annotation
//! - `engine`: the capture → detect → annotate → publish → notify loop
//! - `store`: thread-safe latest frame, operator log and counters
//! - `notify`: alert transports and the hand-off cooldown
//! - `monitor`: application context owning the current pipeline generation
//! - `api`: JSON control surface
//! - `config`: layered file + environment configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod monitor;
pub mod notify;
pub mod store;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use config::{AppConfig, ConfigWriter, FileConfigWriter, NoopConfigWriter};
pub use detect::{Detection, DetectionResult, Detector, SharedDetector};
pub use engine::{EngineContext, EngineSettings, PipelineEngine};
pub use error::{DetectError, MonitorError, PipelineError, SourceError};
pub use frame::{EncodedFrame, Frame};
pub use ingest::{DefaultSourceOpener, FrameRead, FrameSource, SourceConfig, SourceOpener};
pub use monitor::Monitor;
pub use notify::{Cooldown, DisabledNotifier, Notifier, SharedNotifier, TelegramNotifier};
pub use store::{LogEntry, LogLevel, ObservationStore, Stats};
