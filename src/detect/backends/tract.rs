#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::detect::yolo::{decode_output, into_detections, non_max_suppression, DecodeParams};

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Loads a local model file once. Inference resizes the image to the square
/// model input, runs the plan and decodes `[1, 4 + classes, anchors]`.
pub struct TractYoloBackend {
    model: YoloPlan,
    labels: Vec<String>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P, labels: Vec<String>, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            labels,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and NMS IoU thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn run(&self, input: Tensor) -> Result<(Vec<f32>, usize, usize)> {
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!(
                "unexpected model output shape {:?}, expected [1, attrs, anchors]",
                shape
            ));
        }
        let (attrs, anchors) = (shape[1], shape[2]);
        Ok((view.iter().copied().collect(), attrs, anchors))
    }
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.build_input(image);
        let (output, attrs, anchors) = self.run(input)?;

        let params = DecodeParams {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            scale_x: image.width() as f32 / self.input_size as f32,
            scale_y: image.height() as f32 / self.input_size as f32,
        };
        let candidates = decode_output(&output, attrs, anchors, &params)?;
        log::debug!(
            "tract: {} candidates above {:.2}",
            candidates.len(),
            params.confidence_threshold
        );
        let kept = non_max_suppression(candidates, params.iou_threshold);
        Ok(into_detections(kept, &self.labels))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        let input = self.build_input(&blank);
        let (_, attrs, _) = self.run(input)?;
        let classes = attrs.saturating_sub(4);
        if classes != self.labels.len() {
            log::warn!(
                "model predicts {} classes but {} labels were loaded",
                classes,
                self.labels.len()
            );
        }
        Ok(())
    }
}
