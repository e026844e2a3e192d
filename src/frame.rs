//! In-memory frames and their transport encoding.
//!
//! - `Frame`: packed RGB8 pixels plus the instant it was captured. Frames are
//!   ephemeral; each loop iteration overwrites the previous one.
//! - `EncodedFrame`: the JPEG bytes handed to the notifier and the base64 text
//!   published to the observation store.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, RgbImage};

use crate::error::PipelineError;

/// Frames wider than this are downscaled before detection and encoding.
pub const MAX_FRAME_WIDTH: u32 = 640;

/// JPEG quality used for published frames and alerts.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

const CHANNELS: usize = 3;

#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Wrap packed RGB8 pixels. Returns `None` if the buffer length does not
    /// match `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(CHANNELS)?;
        if width == 0 || height == 0 || data.len() != expected {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// A frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = (width.max(1) as usize) * (height.max(1) as usize);
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width: width.max(1),
            height: height.max(1),
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// RGB value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Overwrite the pixel at `(x, y)`. Out-of-bounds writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * CHANNELS;
        self.data[idx..idx + CHANNELS].copy_from_slice(&rgb);
    }

    /// Shrink the frame to `max_width`, keeping the aspect ratio. Frames that
    /// already fit are returned unchanged.
    pub fn downscale_to_width(self, max_width: u32) -> Self {
        if max_width == 0 || self.width <= max_width {
            return self;
        }
        let scale = max_width as f64 / self.width as f64;
        let new_height = ((self.height as f64 * scale) as u32).max(1);
        let captured_at = self.captured_at;
        let Some(image) = self.to_image() else {
            return self;
        };
        let resized = image::imageops::resize(&image, max_width, new_height, FilterType::Triangle);
        let mut frame = Self::from_image(resized);
        frame.captured_at = captured_at;
        frame
    }

    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    /// Encode as JPEG at the given quality (clamped to 1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, PipelineError> {
        let image = self.to_image().ok_or_else(|| {
            PipelineError::EncodingFailure(format!(
                "pixel buffer does not match {}x{}",
                self.width, self.height
            ))
        })?;
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .encode_image(&image)
            .map_err(|err| PipelineError::EncodingFailure(err.to_string()))?;
        Ok(buffer)
    }
}

/// A frame serialized for publishing and alerting.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub base64: String,
}

impl EncodedFrame {
    pub fn encode(frame: &Frame, quality: u8) -> Result<Self, PipelineError> {
        let jpeg = frame.encode_jpeg(quality)?;
        let base64 = BASE64.encode(&jpeg);
        Ok(Self { jpeg, base64 })
    }
}

/// Decode a published base64 frame back into JPEG bytes.
pub fn decode_base64_jpeg(encoded: &str) -> Result<Vec<u8>, PipelineError> {
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|err| PipelineError::EncodingFailure(format!("invalid base64 frame: {err}")))
}
