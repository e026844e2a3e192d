use crate::detect::annotate::draw_detections;
use crate::detect::result::DetectionResult;
use crate::error::DetectError;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends are opaque classifiers over frame regions. They are shared across
/// pipeline generations behind a mutex because `detect` takes `&mut self`
/// (model sessions keep scratch buffers between calls).
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError>;

    /// Render a copy of `frame` with the detections drawn on it.
    fn annotate(&self, frame: &Frame, result: &DetectionResult) -> Frame {
        draw_detections(frame, result)
    }

    /// Does `result` contain at least one box labeled `label`?
    fn contains_class(&self, result: &DetectionResult, label: &str) -> bool {
        result.contains_class(label)
    }

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}
