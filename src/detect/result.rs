use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Detections for one frame, in detector order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    /// True when at least one detection carries exactly `label`.
    pub fn contains_class(&self, label: &str) -> bool {
        self.detections.iter().any(|d| d.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn contains_class_matches_exact_labels() {
        let result = DetectionResult::new(vec![detection("helmet"), detection("head")]);
        assert!(result.contains_class("head"));
        assert!(!result.contains_class("Head"));
        assert!(!result.contains_class("person"));
        assert!(!DetectionResult::default().contains_class("head"));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!((a.intersection_over_union(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.intersection_over_union(&b), 0.0);

        let half = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        let iou = a.intersection_over_union(&half);
        assert!((iou - 50.0 / 150.0).abs() < 1e-6);
    }
}
