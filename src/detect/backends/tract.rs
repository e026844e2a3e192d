#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, DetectionResult};
use crate::error::DetectError;
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// The model is expected to output `[1, 4 + classes, anchors]` with boxes in
/// `cx, cy, w, h` model-input pixels followed by per-class scores.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if class_names.is_empty() {
            return Err(anyhow!("detector class_names must not be empty"));
        }
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{}, {} classes)",
            model_path.display(),
            input_size,
            input_size,
            class_names.len()
        );

        Ok(Self {
            model,
            input_size,
            class_names,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame
            .to_image()
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let side = self.input_size;
        let resized = image::imageops::resize(&image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] < CXYWH_OFFSET + 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let channels = shape[1];
        let anchors = shape[2];
        let classes = (channels - CXYWH_OFFSET).min(self.class_names.len());
        let sx = frame.width() as f32 / self.input_size as f32;
        let sy = frame.height() as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (class_id, score) = (0..classes)
                .map(|c| (c, view[[0, CXYWH_OFFSET + c, a]]))
                .fold((0usize, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, a]] * sx;
            let cy = view[[0, 1, a]] * sy;
            let w = view[[0, 2, a]] * sx;
            let h = view[[0, 3, a]] * sy;
            candidates.push(Detection {
                label: self.class_names[class_id].clone(),
                confidence: score,
                bbox: BoundingBox::new((cx - w / 2.0).max(0.0), (cy - h / 2.0).max(0.0), w, h),
            });
        }

        non_max_suppression(&mut candidates, self.iou_threshold);
        Ok(candidates)
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections.drain(..) {
        let overlaps = kept.iter().any(|k| {
            k.label == candidate.label
                && k.bbox.intersection_over_union(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    *detections = kept;
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError> {
        let input = self
            .build_input(frame)
            .map_err(|err| DetectError::new(format!("{err:#}")))?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|err| DetectError::new(format!("ONNX inference failed: {err:#}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::new("model produced no outputs"))?;
        let detections = self
            .decode(output, frame)
            .map_err(|err| DetectError::new(format!("{err:#}")))?;
        Ok(DetectionResult::new(detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32, x: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox: BoundingBox::new(x, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn nms_keeps_best_overlapping_box_per_class() {
        let mut detections = vec![
            det("head", 0.6, 1.0),
            det("head", 0.9, 0.0),
            det("helmet", 0.7, 0.0),
            det("head", 0.8, 50.0),
        ];
        non_max_suppression(&mut detections, 0.45);
        let summary: Vec<(&str, f32)> = detections
            .iter()
            .map(|d| (d.label.as_str(), d.confidence))
            .collect();
        assert_eq!(summary, vec![("head", 0.9), ("head", 0.8), ("helmet", 0.7)]);
    }
}
