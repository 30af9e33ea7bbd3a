use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend for testing and model-less runs.
///
/// Replays a fixed detection list on every call, clipped to the image.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    scripted: Vec<Detection>,
}

impl StubBackend {
    /// A backend that never detects anything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(scripted: Vec<Detection>) -> Self {
        Self { scripted }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self
            .scripted
            .iter()
            .cloned()
            .filter_map(|det| det.clamped_to(image.width(), image.height()))
            .collect())
    }
}
