//! Local file frame source using FFmpeg.
//!
//! Frames are decoded in-memory and converted to packed RGB24. When the demuxer
//! runs out of packets the decoder is drained and `EndOfStream` is reported;
//! `rewind` seeks to the start and flushes the decoder so the file loops.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::FileConfig;
use super::FrameRead;
use crate::error::SourceError;
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    open: bool,
    draining: bool,
    frame_count: u64,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            config,
            input,
            stream_index,
            decoder,
            scaler,
            open: false,
            draining: false,
            frame_count: 0,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.open = true;
        log::info!("file source connected: {} (ffmpeg)", self.config.path);
        Ok(())
    }

    pub(crate) fn path(&self) -> &str {
        &self.config.path
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn read_frame(&mut self) -> Result<FrameRead, SourceError> {
        if !self.open {
            return Err(SourceError::Closed);
        }
        let mut decoded = ffmpeg::frame::Video::empty();

        if !self.draining {
            let mut received = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .map_err(|err| SourceError::Read(format!("send packet to decoder: {err}")))?;
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    received = true;
                    break;
                }
            }
            if received {
                return self.convert(&decoded).map(FrameRead::Frame);
            }
            // Demuxer exhausted; flush frames still buffered in the decoder.
            self.decoder
                .send_eof()
                .map_err(|err| SourceError::Read(format!("send eof to decoder: {err}")))?;
            self.draining = true;
        }

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.convert(&decoded).map(FrameRead::Frame);
        }
        Ok(FrameRead::EndOfStream)
    }

    pub(crate) fn rewind(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Err(SourceError::Closed);
        }
        self.input
            .seek(0, ..)
            .map_err(|err| SourceError::Rewind(err.to_string()))?;
        self.decoder.flush();
        self.draining = false;
        log::debug!(
            "file source rewound: {} after {} frames",
            self.config.path,
            self.frame_count
        );
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if self.open {
            log::info!("file source closed: {}", self.config.path);
        }
        self.open = false;
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame, SourceError> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|err| SourceError::Read(format!("scale frame to RGB: {err}")))?;
        let (pixels, width, height) =
            frame_to_pixels(&rgb_frame).map_err(|err| SourceError::Read(format!("{err:#}")))?;
        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels)
            .ok_or_else(|| SourceError::Read("decoded frame has inconsistent size".to_string()))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
