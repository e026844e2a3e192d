//! Error taxonomy for the capture/detect/notify pipeline.
//!
//! Collaborators report their own narrow error types (`SourceError`,
//! `DetectError`); the engine folds them into `PipelineError` at its boundary.
//! Only `PipelineError::SourceUnavailable` from `PipelineEngine::start` ever
//! reaches a caller synchronously; everything else is contained in the loop.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("detection failed: {0}")]
    DetectionFailure(String),

    #[error("notifier unavailable: {0}")]
    NotifierUnavailable(String),

    #[error("frame encoding failed: {0}")]
    EncodingFailure(String),
}

/// Failure while reading from an already opened frame source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source is closed")]
    Closed,

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("failed to rewind source: {0}")]
    Rewind(String),
}

/// Failure reported by a detector backend for a single frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DetectError(pub String);

impl DetectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<DetectError> for PipelineError {
    fn from(err: DetectError) -> Self {
        PipelineError::DetectionFailure(err.0)
    }
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        PipelineError::SourceUnavailable(err.to_string())
    }
}

/// Errors surfaced to the control surface by `Monitor`.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("no frame available yet")]
    NoFrame,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration update failed: {0}")]
    Config(String),
}
