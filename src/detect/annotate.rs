//! CPU rendering of detection boxes onto a frame copy.

use crate::detect::result::{BoundingBox, DetectionResult};
use crate::frame::Frame;

const BOX_THICKNESS: u32 = 2;
const LABEL_BAR_HEIGHT: u32 = 6;
const LABEL_BAR_MAX_WIDTH: u32 = 60;

const PALETTE: [[u8; 3]; 6] = [
    [255, 56, 56],
    [72, 249, 10],
    [255, 157, 151],
    [0, 194, 255],
    [255, 178, 29],
    [207, 210, 49],
];

/// Stable color for a class label.
pub fn label_color(label: &str) -> [u8; 3] {
    let hash = label
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Draw each detection as a box outline with a confidence bar above it.
pub fn draw_detections(frame: &Frame, result: &DetectionResult) -> Frame {
    let mut annotated = frame.clone();
    for detection in &result.detections {
        let color = label_color(&detection.label);
        let Some((left, top, right, bottom)) = clamp_box(&detection.bbox, &annotated) else {
            continue;
        };
        for t in 0..BOX_THICKNESS {
            draw_rect_outline(
                &mut annotated,
                left + t,
                top + t,
                right.saturating_sub(t),
                bottom.saturating_sub(t),
                color,
            );
        }

        let confidence = detection.confidence.clamp(0.0, 1.0);
        let bar_width = ((LABEL_BAR_MAX_WIDTH as f32) * confidence).round() as u32;
        let bar_top = top.saturating_sub(LABEL_BAR_HEIGHT + 1);
        fill_rect(
            &mut annotated,
            left,
            bar_top,
            left + bar_width.max(1),
            bar_top + LABEL_BAR_HEIGHT,
            color,
        );
    }
    annotated
}

fn clamp_box(bbox: &BoundingBox, frame: &Frame) -> Option<(u32, u32, u32, u32)> {
    let max_x = frame.width().saturating_sub(1) as f32;
    let max_y = frame.height().saturating_sub(1) as f32;
    let left = bbox.x.clamp(0.0, max_x);
    let top = bbox.y.clamp(0.0, max_y);
    let right = (bbox.x + bbox.w).clamp(0.0, max_x);
    let bottom = (bbox.y + bbox.h).clamp(0.0, max_y);
    if right <= left || bottom <= top {
        return None;
    }
    Some((
        left.round() as u32,
        top.round() as u32,
        right.round() as u32,
        bottom.round() as u32,
    ))
}

fn draw_rect_outline(frame: &mut Frame, left: u32, top: u32, right: u32, bottom: u32, color: [u8; 3]) {
    if right < left || bottom < top {
        return;
    }
    for x in left..=right {
        frame.put_pixel(x, top, color);
        frame.put_pixel(x, bottom, color);
    }
    for y in top..=bottom {
        frame.put_pixel(left, y, color);
        frame.put_pixel(right, y, color);
    }
}

fn fill_rect(frame: &mut Frame, left: u32, top: u32, right: u32, bottom: u32, color: [u8; 3]) {
    for y in top..bottom {
        for x in left..right {
            frame.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::Detection;

    #[test]
    fn draws_outline_in_label_color_and_keeps_interior() {
        let frame = Frame::solid(100, 100, [0, 0, 0]);
        let result = DetectionResult::new(vec![Detection {
            label: "head".to_string(),
            confidence: 0.8,
            bbox: BoundingBox::new(20.0, 30.0, 40.0, 40.0),
        }]);
        let annotated = draw_detections(&frame, &result);
        let color = label_color("head");

        assert_eq!(annotated.pixel(20, 30), Some(color));
        assert_eq!(annotated.pixel(60, 70), Some(color));
        assert_eq!(annotated.pixel(40, 50), Some([0, 0, 0]));
        // Original frame is untouched.
        assert_eq!(frame.pixel(20, 30), Some([0, 0, 0]));
    }

    #[test]
    fn boxes_outside_the_frame_are_skipped() {
        let frame = Frame::solid(10, 10, [5, 5, 5]);
        let result = DetectionResult::new(vec![Detection {
            label: "helmet".to_string(),
            confidence: 0.5,
            bbox: BoundingBox::new(50.0, 50.0, 10.0, 10.0),
        }]);
        let annotated = draw_detections(&frame, &result);
        assert_eq!(annotated.pixels(), frame.pixels());
    }

    #[test]
    fn label_colors_are_stable() {
        assert_eq!(label_color("head"), label_color("head"));
    }
}
