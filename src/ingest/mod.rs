//! Frame ingestion sources.
//!
//! This module provides the video origins the pipeline reads from:
//! - Camera devices (V4L2, feature: ingest-v4l2)
//! - Local video files, looped on end-of-stream (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` sources for tests and demos
//!
//! A `SourceConfig` is an immutable value. Switching sources never mutates an
//! open source; the pipeline is torn down and rebuilt against the new config.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, SourceError};
use crate::frame::Frame;

pub mod device;
mod discover;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;

pub use device::{DeviceConfig, DeviceSource};
pub use discover::{list_devices, list_media_files, MEDIA_EXTENSIONS};
pub use file::{FileConfig, FileSource};

/// Identifies the active video origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Camera device node (e.g. "/dev/video0") or `stub://name`.
    Device { device: String },
    /// Local video file or `stub://name`, played in a loop.
    File { path: String },
}

impl SourceConfig {
    /// Device source for a numeric camera index.
    pub fn device_index(index: u32) -> Self {
        SourceConfig::Device {
            device: format!("/dev/video{index}"),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        SourceConfig::File { path: path.into() }
    }

    /// Parse `device:<index|path>` or `file:<path>`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        let (kind, rest) = value
            .split_once(':')
            .ok_or_else(|| format!("source '{value}' must be 'device:<id>' or 'file:<path>'"))?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(format!("source '{value}' has an empty identifier"));
        }
        match kind.trim().to_ascii_lowercase().as_str() {
            "device" | "camera" | "webcam" => match rest.parse::<u32>() {
                Ok(index) => Ok(Self::device_index(index)),
                Err(_) => Ok(SourceConfig::Device {
                    device: rest.to_string(),
                }),
            },
            "file" | "video" => Ok(Self::file(rest)),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            SourceConfig::Device { device } => device,
            SourceConfig::File { path } => path,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, SourceConfig::File { .. })
    }

    pub fn is_stub(&self) -> bool {
        self.identifier().starts_with("stub://")
    }
}

impl fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceConfig::Device { device } => write!(f, "device:{device}"),
            SourceConfig::File { path } => write!(f, "file:{path}"),
        }
    }
}

/// Outcome of a single read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// A finite source reached its end; call `rewind` to loop.
    EndOfStream,
    /// No frame right now; try again shortly.
    NotReady,
}

/// An opened video origin.
pub trait FrameSource: Send {
    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    /// Finite sources (files) report `EndOfStream` and can be rewound.
    fn is_finite(&self) -> bool;

    fn read_frame(&mut self) -> Result<FrameRead, SourceError>;

    fn rewind(&mut self) -> Result<(), SourceError>;

    /// Release the underlying device or file. Idempotent.
    fn close(&mut self);
}

/// Opens frame sources for a `SourceConfig`.
pub trait SourceOpener: Send + Sync {
    fn open(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>, PipelineError>;
}

/// Opener backed by the sources compiled into this crate.
#[derive(Clone, Debug)]
pub struct DefaultSourceOpener {
    pub device_width: u32,
    pub device_height: u32,
    pub device_fps: u32,
}

impl Default for DefaultSourceOpener {
    fn default() -> Self {
        Self {
            device_width: 640,
            device_height: 480,
            device_fps: 30,
        }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
        let unavailable =
            |err: anyhow::Error| PipelineError::SourceUnavailable(format!("{config}: {err:#}"));
        match config {
            SourceConfig::Device { device } => {
                let mut source = DeviceSource::new(DeviceConfig {
                    device: device.clone(),
                    target_fps: self.device_fps,
                    width: self.device_width,
                    height: self.device_height,
                })
                .map_err(unavailable)?;
                source.connect().map_err(unavailable)?;
                Ok(Box::new(source))
            }
            SourceConfig::File { path } => {
                let mut source = FileSource::new(FileConfig { path: path.clone() })
                .map_err(unavailable)?;
                source.connect().map_err(unavailable)?;
                Ok(Box::new(source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_and_file_specs() {
        assert_eq!(
            SourceConfig::parse("device:0").unwrap(),
            SourceConfig::Device {
                device: "/dev/video0".to_string()
            }
        );
        assert_eq!(
            SourceConfig::parse("device:stub://cam").unwrap(),
            SourceConfig::Device {
                device: "stub://cam".to_string()
            }
        );
        assert_eq!(
            SourceConfig::parse(" file:clips/site.mp4 ").unwrap(),
            SourceConfig::file("clips/site.mp4")
        );
        assert!(SourceConfig::parse("site.mp4").is_err());
        assert!(SourceConfig::parse("file:").is_err());
        assert!(SourceConfig::parse("rtsp:cam").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let config = SourceConfig::file("stub://clip");
        assert_eq!(config.to_string(), "file:stub://clip");
        assert_eq!(SourceConfig::parse(&config.to_string()).unwrap(), config);
        assert!(config.is_stub());
        assert!(config.is_file());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(SourceConfig::device_index(2)).unwrap();
        assert_eq!(json["kind"], "device");
        assert_eq!(json["device"], "/dev/video2");
    }

    #[test]
    fn default_opener_opens_stub_sources() {
        let opener = DefaultSourceOpener::default();
        let mut source = opener.open(&SourceConfig::file("stub://clip")).unwrap();
        assert!(source.is_open());
        assert!(source.is_finite());
        assert!(matches!(source.read_frame().unwrap(), FrameRead::Frame(_)));
        source.close();
        assert!(!source.is_open());
    }

    #[test]
    fn default_opener_rejects_remote_files() {
        let opener = DefaultSourceOpener::default();
        let err = opener
            .open(&SourceConfig::file("http://example.com/clip.mp4"))
            .err()
            .expect("remote paths must be rejected");
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    }
}
