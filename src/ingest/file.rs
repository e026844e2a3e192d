//! Local file frame source.
//!
//! `FileSource` reads frames from a local video file and loops it: the end of
//! the file is reported as `FrameRead::EndOfStream` and `rewind` seeks back to
//! the first frame.
//!
//! The file source MUST NOT fetch remote URLs or write decoded frames to disk.
//!
//! `stub://name?frames=N&marker_every=M` selects a synthetic clip of `N`
//! frames in which every `M`th frame carries a red marker square.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{FrameRead, FrameSource};
use crate::error::SourceError;
use crate::frame::Frame;

pub const SYNTHETIC_WIDTH: u32 = 320;
pub const SYNTHETIC_HEIGHT: u32 = 240;
const DEFAULT_SYNTHETIC_FRAMES: u64 = 90;
const DEFAULT_MARKER_EVERY: u64 = 30;
const MARKER_SIZE: u32 = 24;

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "/srv/media/site.mp4") or `stub://name`.
    pub path: String,
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticClip),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        if config.path.starts_with("stub://") {
            Ok(Self {
                backend: FileBackend::Synthetic(SyntheticClip::from_uri(&config.path, true)?),
            })
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Self {
                    backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
                })
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                Err(anyhow!(
                    "file ingestion requires the ingest-file-ffmpeg feature"
                ))
            }
        }
    }

    /// Open the underlying file.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(source) => source.describe(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => format!("file {}", source.path()),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(source) => source.is_open(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_open(),
        }
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.read_frame(),
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.rewind(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.rewind(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.close(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

/// Generated frames with a periodic red marker. Finite clips end after
/// `frames` frames; endless ones (synthetic cameras) never do.
pub(crate) struct SyntheticClip {
    uri: String,
    frames: u64,
    marker_every: u64,
    finite: bool,
    position: u64,
    open: bool,
}

impl SyntheticClip {
    pub(crate) fn from_uri(uri: &str, finite: bool) -> Result<Self> {
        let mut frames = DEFAULT_SYNTHETIC_FRAMES;
        let mut marker_every = DEFAULT_MARKER_EVERY;
        if let Some((_, query)) = uri.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed stub parameter '{pair}'"))?;
                let value: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("stub parameter '{key}' must be an integer"))?;
                match key {
                    "frames" => frames = value,
                    "marker_every" => marker_every = value,
                    other => return Err(anyhow!("unknown stub parameter '{other}'")),
                }
            }
        }
        if frames == 0 {
            return Err(anyhow!("stub clip must have at least one frame"));
        }
        Ok(Self {
            uri: uri.to_string(),
            frames,
            marker_every,
            finite,
            position: 0,
            open: false,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.open = true;
        log::info!("synthetic source connected: {}", self.uri);
        Ok(())
    }

    pub(crate) fn describe(&self) -> String {
        format!("synthetic {}", self.uri)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
        if !self.open {
            return Err(SourceError::Closed);
        }
        if self.finite && self.position >= self.frames {
            return Ok(FrameRead::EndOfStream);
        }
        let frame = self.render(self.position);
        self.position += 1;
        Ok(FrameRead::Frame(frame))
    }

    pub(crate) fn rewind(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Err(SourceError::Closed);
        }
        self.position = 0;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if self.open {
            log::debug!("synthetic source closed: {}", self.uri);
        }
        self.open = false;
    }

    /// Whether frame `index` (0-based) carries the marker.
    fn has_marker(&self, index: u64) -> bool {
        self.marker_every > 0 && (index + 1) % self.marker_every == 0
    }

    fn render(&self, index: u64) -> Frame {
        let shade = (index % 64) as u8;
        let mut frame = Frame::solid(
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            [40 + shade, 60 + shade, 80],
        );
        if self.has_marker(index) {
            let x0 = (index as u32 * 7) % (SYNTHETIC_WIDTH - MARKER_SIZE);
            let y0 = SYNTHETIC_HEIGHT / 3;
            for y in y0..y0 + MARKER_SIZE {
                for x in x0..x0 + MARKER_SIZE {
                    frame.put_pixel(x, y, [255, 0, 0]);
                }
            }
        }
        frame
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(path: &str) -> FileSource {
        let mut source = FileSource::new(FileConfig {
            path: path.to_string(),
        })
        .unwrap();
        source.connect().unwrap();
        source
    }

    fn frame(read: FrameRead) -> Frame {
        match read {
            FrameRead::Frame(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn synthetic_clip_ends_and_rewinds() {
        let mut source = open("stub://clip?frames=3&marker_every=0");
        for _ in 0..3 {
            frame(source.read_frame().unwrap());
        }
        assert!(matches!(
            source.read_frame().unwrap(),
            FrameRead::EndOfStream
        ));
        source.rewind().unwrap();
        let first = frame(source.read_frame().unwrap());
        assert_eq!(first.width(), SYNTHETIC_WIDTH);
        assert_eq!(first.height(), SYNTHETIC_HEIGHT);
    }

    #[test]
    fn marker_appears_on_every_nth_frame() {
        let mut source = open("stub://clip?frames=6&marker_every=3");
        let marked: Vec<bool> = (0..6)
            .map(|_| {
                let f = frame(source.read_frame().unwrap());
                f.pixels()
                    .chunks_exact(3)
                    .any(|px| px == [255, 0, 0])
            })
            .collect();
        assert_eq!(marked, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn closed_source_refuses_reads() {
        let mut source = open("stub://clip");
        source.close();
        source.close();
        assert!(!source.is_open());
        assert_eq!(source.read_frame().unwrap_err(), SourceError::Closed);
    }

    #[test]
    fn rejects_remote_and_malformed_paths() {
        assert!(FileSource::new(FileConfig {
            path: "rtsp://camera/stream".to_string()
        })
        .is_err());
        assert!(FileSource::new(FileConfig {
            path: "stub://clip?frames=zero".to_string()
        })
        .is_err());
        assert!(FileSource::new(FileConfig {
            path: "stub://clip?fps=3".to_string()
        })
        .is_err());
    }
}
