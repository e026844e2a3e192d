use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, DetectionResult};
use crate::error::DetectError;
use crate::frame::Frame;

/// Minimum red channel for a marker pixel.
const MARKER_RED_MIN: u8 = 200;
/// Maximum green/blue channel for a marker pixel.
const MARKER_OTHER_MAX: u8 = 60;

/// Stub backend for testing and demos.
///
/// Reports a single box around saturated red marker pixels, labeled with the
/// configured class. Synthetic `stub://` sources paint such markers into some
/// of their frames.
pub struct StubBackend {
    label: String,
    min_pixels: usize,
}

impl StubBackend {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            min_pixels: 16,
        }
    }

    pub fn with_min_pixels(mut self, min_pixels: usize) -> Self {
        self.min_pixels = min_pixels.max(1);
        self
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError> {
        let width = frame.width();
        let mut count = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);

        for (idx, rgb) in frame.pixels().chunks_exact(3).enumerate() {
            if rgb[0] < MARKER_RED_MIN || rgb[1] > MARKER_OTHER_MAX || rgb[2] > MARKER_OTHER_MAX {
                continue;
            }
            let x = (idx as u32) % width;
            let y = (idx as u32) / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            count += 1;
        }

        if count < self.min_pixels {
            return Ok(DetectionResult::default());
        }

        let area = ((max_x - min_x + 1) * (max_y - min_y + 1)) as f32;
        Ok(DetectionResult::new(vec![Detection {
            label: self.label.clone(),
            confidence: (count as f32 / area).clamp(0.0, 1.0),
            bbox: BoundingBox::new(
                min_x as f32,
                min_y as f32,
                (max_x - min_x + 1) as f32,
                (max_y - min_y + 1) as f32,
            ),
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paint_marker(frame: &mut Frame, x0: u32, y0: u32, size: u32) {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                frame.put_pixel(x, y, [255, 0, 0]);
            }
        }
    }

    #[test]
    fn stub_backend_finds_marker() {
        let mut backend = StubBackend::new("head");
        let mut frame = Frame::solid(64, 64, [30, 30, 30]);
        paint_marker(&mut frame, 10, 20, 8);

        let result = backend.detect(&frame).unwrap();
        assert_eq!(result.len(), 1);
        let detection = &result.detections[0];
        assert_eq!(detection.label, "head");
        assert_eq!(detection.bbox, BoundingBox::new(10.0, 20.0, 8.0, 8.0));
        assert!((detection.confidence - 1.0).abs() < 1e-6);
        assert!(backend.contains_class(&result, "head"));
    }

    #[test]
    fn stub_backend_ignores_plain_frames_and_specks() {
        let mut backend = StubBackend::new("head");
        let mut frame = Frame::solid(32, 32, [200, 200, 200]);
        assert!(backend.detect(&frame).unwrap().is_empty());

        frame.put_pixel(3, 3, [255, 0, 0]);
        assert!(backend.detect(&frame).unwrap().is_empty());
    }
}
