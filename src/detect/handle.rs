use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::config::{DetectorKind, DetectorSettings};
use crate::detect::backend::DetectorBackend;
use crate::detect::backends::StubBackend;
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::labels::normalize_label;

/// Process-wide detector, constructed once at startup.
///
/// A failed model load does not abort the process. The handle keeps the load
/// error and every `detect` call reports `ModelUnavailable` until restart;
/// there is no per-request reload.
pub struct DetectorHandle {
    state: DetectorState,
}

enum DetectorState {
    Ready {
        name: &'static str,
        backend: Mutex<Box<dyn DetectorBackend>>,
    },
    Unavailable(String),
}

impl DetectorHandle {
    pub fn ready<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self {
            state: DetectorState::Ready {
                name: backend.name(),
                backend: Mutex::new(Box::new(backend)),
            },
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            state: DetectorState::Unavailable(reason.into()),
        }
    }

    /// Build the configured backend. Load errors are logged and kept.
    pub fn load(settings: &DetectorSettings) -> Self {
        match Self::try_load(settings) {
            Ok(handle) => {
                log::info!(
                    "detector ready (backend: {})",
                    handle.backend_name().unwrap_or("?")
                );
                handle
            }
            Err(err) => {
                log::error!("failed to load detector model: {:#}", err);
                Self::unavailable(format!("{:#}", err))
            }
        }
    }

    fn try_load(settings: &DetectorSettings) -> Result<Self> {
        match settings.backend {
            DetectorKind::Stub => Ok(Self::ready(StubBackend::new())),
            DetectorKind::Tract => Self::load_tract(settings),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn load_tract(settings: &DetectorSettings) -> Result<Self> {
        use crate::detect::backends::TractYoloBackend;

        let model_path = settings
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("no model path configured"))?;
        let labels_path = settings
            .labels_path
            .as_ref()
            .ok_or_else(|| anyhow!("no labels path configured"))?;
        let labels = crate::labels::load_labels(labels_path)?;
        log::info!(
            "loading model {} ({} labels, input {}px)",
            model_path.display(),
            labels.len(),
            settings.input_size
        );
        let mut backend = TractYoloBackend::load(model_path, labels, settings.input_size)?
            .with_thresholds(settings.confidence_threshold, settings.iou_threshold);
        backend.warm_up()?;
        Ok(Self::ready(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn load_tract(_settings: &DetectorSettings) -> Result<Self> {
        Err(anyhow!("built without the backend-tract feature"))
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, DetectorState::Ready { .. })
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        match &self.state {
            DetectorState::Ready { name, .. } => Some(*name),
            DetectorState::Unavailable(_) => None,
        }
    }

    /// Fail fast when the model never loaded.
    pub fn ensure_available(&self) -> Result<(), PipelineError> {
        match &self.state {
            DetectorState::Ready { .. } => Ok(()),
            DetectorState::Unavailable(reason) => {
                Err(PipelineError::ModelUnavailable(reason.clone()))
            }
        }
    }

    /// Run the model and return typed detections.
    ///
    /// Labels are normalized, boxes clamped into the image (empty boxes
    /// dropped) and the list sorted by descending confidence.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, PipelineError> {
        let backend = match &self.state {
            DetectorState::Ready { backend, .. } => backend,
            DetectorState::Unavailable(reason) => {
                return Err(PipelineError::ModelUnavailable(reason.clone()))
            }
        };

        let raw = {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            guard.detect(image)?
        };

        let (width, height) = image.dimensions();
        let mut detections: Vec<Detection> = raw
            .into_iter()
            .filter_map(|det| det.clamped_to(width, height))
            .map(|mut det| {
                det.label = normalize_label(&det.label);
                det.nutrition = None;
                det
            })
            .collect();
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn unavailable_handle_rejects_detection() {
        let handle = DetectorHandle::unavailable("weights missing");
        assert!(!handle.is_available());
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        match handle.detect(&img) {
            Err(PipelineError::ModelUnavailable(reason)) => assert_eq!(reason, "weights missing"),
            other => panic!("expected ModelUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn normalizes_sorts_and_clamps_backend_output() {
        let handle = DetectorHandle::ready(StubBackend::with_detections(vec![
            Detection::new("fried_rice", 0.4, [0.0, 0.0, 10.0, 10.0]),
            Detection::new("egg", 0.9, [5.0, 5.0, 500.0, 15.0]),
            Detection::new("egg", 0.7, [50.0, 50.0, 60.0, 60.0]),
        ]));
        let img = RgbImage::from_pixel(32, 20, Rgb([0, 0, 0]));
        let dets = handle.detect(&img).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].label, "Egg");
        assert_eq!(dets[0].bbox, [5.0, 5.0, 32.0, 15.0]);
        assert_eq!(dets[1].label, "Fried Rice");
    }

    #[test]
    fn stub_settings_load_an_available_detector() {
        let settings = DetectorSettings {
            backend: DetectorKind::Stub,
            ..DetectorSettings::default()
        };
        let handle = DetectorHandle::load(&settings);
        assert_eq!(handle.backend_name(), Some("stub"));
    }

    #[test]
    fn missing_model_path_degrades_instead_of_panicking() {
        let settings = DetectorSettings {
            backend: DetectorKind::Tract,
            model_path: None,
            ..DetectorSettings::default()
        };
        let handle = DetectorHandle::load(&settings);
        assert!(!handle.is_available());
        assert!(handle.ensure_available().is_err());
    }
}
