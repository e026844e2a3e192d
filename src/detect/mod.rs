//! Object detection backends.
//!
//! The pipeline only needs three things from a detector: boxes for a frame,
//! an annotated copy of the frame, and a class-membership test. Backends are
//! loaded once and shared across pipeline generations as a `SharedDetector`.

mod annotate;
mod backend;
mod backends;
mod result;

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::{DetectorKind, DetectorSettings};

pub use annotate::{draw_detections, label_color};
pub use backend::Detector;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, Detection, DetectionResult};

/// Detector shared between the pipeline loop of each generation.
pub type SharedDetector = Arc<Mutex<dyn Detector>>;

/// Wrap a backend for sharing.
pub fn shared<D: Detector + 'static>(detector: D) -> SharedDetector {
    Arc::new(Mutex::new(detector))
}

/// Build the configured backend and run its warm-up hook.
pub fn build_detector(settings: &DetectorSettings) -> Result<SharedDetector> {
    match settings.backend {
        DetectorKind::Stub => {
            log::info!(
                "detector: stub backend (marker pixels reported as '{}')",
                settings.target_class
            );
            Ok(shared(StubBackend::new(settings.target_class.clone())))
        }
        DetectorKind::Tract => build_tract(settings),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings) -> Result<SharedDetector> {
    let mut backend = TractBackend::new(
        &settings.model_path,
        settings.input_size,
        settings.class_names.clone(),
    )?
    .with_threshold(settings.confidence_threshold);
    backend
        .warm_up()
        .map_err(|err| anyhow::anyhow!("detector warm-up failed: {err}"))?;
    Ok(shared(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectorSettings) -> Result<SharedDetector> {
    Err(anyhow::anyhow!(
        "tract detector requires the backend-tract feature"
    ))
}
