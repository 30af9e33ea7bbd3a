//! The `detect_food` orchestrator.
//!
//! One request runs strictly in order: content-type gate, decode, model
//! availability check, detection, label dedup, one batched nutrition lookup,
//! merge, annotation. Each stage consumes the previous stage's output, so
//! there is no parallelism inside a request. Concurrent requests share the
//! pipeline through an `Arc` and only contend on the detector lock and the
//! store connection.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::annotate::Annotator;
use crate::detect::{Detection, DetectorHandle};
use crate::error::PipelineError;
use crate::frame::{check_content_type, decode_upload};
use crate::nutrition::NutritionResolver;

/// What to do when the nutrition store fails mid-request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverFailurePolicy {
    /// Fail the whole request with `ResolverFailure`.
    #[default]
    Fail,
    /// Return detections with empty nutrition and flag the batch.
    Degrade,
}

impl std::str::FromStr for ResolverFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(ResolverFailurePolicy::Fail),
            "degrade" => Ok(ResolverFailurePolicy::Degrade),
            other => Err(anyhow!(
                "unknown resolver failure policy '{}' (expected fail or degrade)",
                other
            )),
        }
    }
}

/// Response payload of one detection request.
///
/// Fields are private so `count == predictions.len()` holds by construction.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionBatch {
    predictions: Vec<Detection>,
    count: usize,
    image: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    nutrition_degraded: bool,
}

impl DetectionBatch {
    pub fn new(predictions: Vec<Detection>, image: String) -> Self {
        Self {
            count: predictions.len(),
            predictions,
            image,
            nutrition_degraded: false,
        }
    }

    fn degraded(mut self) -> Self {
        self.nutrition_degraded = true;
        self
    }

    pub fn predictions(&self) -> &[Detection] {
        &self.predictions
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Base64 JPEG of the annotated image.
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn nutrition_degraded(&self) -> bool {
        self.nutrition_degraded
    }
}

pub struct FoodPipeline {
    detector: DetectorHandle,
    resolver: Arc<dyn NutritionResolver>,
    annotator: Annotator,
    on_resolver_failure: ResolverFailurePolicy,
}

impl FoodPipeline {
    pub fn new(
        detector: DetectorHandle,
        resolver: Arc<dyn NutritionResolver>,
        annotator: Annotator,
    ) -> Self {
        Self {
            detector,
            resolver,
            annotator,
            on_resolver_failure: ResolverFailurePolicy::default(),
        }
    }

    pub fn with_resolver_policy(mut self, policy: ResolverFailurePolicy) -> Self {
        self.on_resolver_failure = policy;
        self
    }

    pub fn model_loaded(&self) -> bool {
        self.detector.is_available()
    }

    /// Run one upload through the whole pipeline.
    pub fn detect_food(
        &self,
        image_bytes: &[u8],
        content_type: &str,
    ) -> Result<DetectionBatch, PipelineError> {
        let started = Instant::now();
        check_content_type(content_type)?;
        let image = decode_upload(image_bytes)?;
        self.detector.ensure_available()?;

        let mut detections = self.detector.detect(&image)?;
        let labels = distinct_labels(&detections);
        log::debug!(
            "detected {} objects ({} distinct labels) in {}x{} image",
            detections.len(),
            labels.len(),
            image.width(),
            image.height()
        );

        let mut degraded = false;
        match self.resolver.lookup_many(&labels) {
            Ok(nutrition) => {
                for detection in detections.iter_mut() {
                    detection.nutrition = nutrition.get(&detection.label).cloned();
                }
            }
            Err(err) => match self.on_resolver_failure {
                ResolverFailurePolicy::Fail => {
                    return Err(PipelineError::ResolverFailure(format!("{:#}", err)));
                }
                ResolverFailurePolicy::Degrade => {
                    log::warn!(
                        "nutrition lookup failed, returning detections without nutrition: {:#}",
                        err
                    );
                    degraded = true;
                }
            },
        }

        let encoded = self.annotator.annotate(&image, &detections)?;
        let batch = DetectionBatch::new(detections, encoded);
        log::debug!(
            "request done: {} predictions in {:?}",
            batch.count(),
            started.elapsed()
        );
        Ok(if degraded { batch.degraded() } else { batch })
    }
}

/// Unique labels across a detection list, each appearing once.
pub fn distinct_labels(detections: &[Detection]) -> BTreeSet<String> {
    detections.iter().map(|d| d.label.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_labels_dedups() {
        let dets = vec![
            Detection::new("Egg", 0.9, [0.0, 0.0, 1.0, 1.0]),
            Detection::new("Rice", 0.8, [0.0, 0.0, 1.0, 1.0]),
            Detection::new("Egg", 0.7, [0.0, 0.0, 1.0, 1.0]),
        ];
        let labels = distinct_labels(&dets);
        assert_eq!(labels.into_iter().collect::<Vec<_>>(), vec!["Egg", "Rice"]);
    }

    #[test]
    fn batch_count_tracks_predictions() {
        let batch = DetectionBatch::new(
            vec![Detection::new("Egg", 0.9, [0.0, 0.0, 1.0, 1.0])],
            "abc".to_string(),
        );
        assert_eq!(batch.count(), batch.predictions().len());
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["count"], 1);
        assert!(value.get("nutrition_degraded").is_none());
    }

    #[test]
    fn parses_failure_policy() {
        assert_eq!(
            "Degrade".parse::<ResolverFailurePolicy>().unwrap(),
            ResolverFailurePolicy::Degrade
        );
        assert!("retry".parse::<ResolverFailurePolicy>().is_err());
    }
}
