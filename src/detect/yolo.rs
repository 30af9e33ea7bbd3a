//! YOLOv8-style output decoding.
//!
//! The model emits one `[4 + classes, anchors]` matrix per image: rows 0..4
//! hold the box centre and size, the remaining rows one score per class. This
//! module turns that matrix into scored boxes and applies class-wise NMS. It
//! has no runtime dependency so it can be exercised without a model.

use anyhow::{anyhow, Result};

use crate::detect::result::Detection;

const BOX_ATTRS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Multiplier from model input x coordinates to original image x.
    pub scale_x: f32,
    /// Multiplier from model input y coordinates to original image y.
    pub scale_y: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// Decode a row-major `[attrs, anchors]` output into candidates above the
/// confidence threshold, in original image coordinates.
pub fn decode_output(
    output: &[f32],
    attrs: usize,
    anchors: usize,
    params: &DecodeParams,
) -> Result<Vec<Candidate>> {
    if attrs <= BOX_ATTRS {
        return Err(anyhow!(
            "model output has {} attributes per anchor, expected more than {}",
            attrs,
            BOX_ATTRS
        ));
    }
    let expected = attrs
        .checked_mul(anchors)
        .ok_or_else(|| anyhow!("model output dimensions overflow"))?;
    if output.len() != expected {
        return Err(anyhow!(
            "model output length mismatch: expected {}, got {}",
            expected,
            output.len()
        ));
    }

    let num_classes = attrs - BOX_ATTRS;
    let at = |row: usize, anchor: usize| output[row * anchors + anchor];
    let mut candidates = Vec::new();

    for anchor in 0..anchors {
        let mut best_score = f32::MIN;
        let mut best_class = 0usize;
        for class_id in 0..num_classes {
            let score = at(BOX_ATTRS + class_id, anchor);
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }
        if !best_score.is_finite() || best_score < params.confidence_threshold {
            continue;
        }

        let cx = at(0, anchor);
        let cy = at(1, anchor);
        let w = at(2, anchor);
        let h = at(3, anchor);

        candidates.push(Candidate {
            class_id: best_class,
            score: best_score,
            bbox: [
                (cx - w / 2.0) * params.scale_x,
                (cy - h / 2.0) * params.scale_y,
                (cx + w / 2.0) * params.scale_x,
                (cy + h / 2.0) * params.scale_y,
            ],
        });
    }

    Ok(candidates)
}

/// Class-wise non-maximum suppression.
///
/// Output is sorted by descending score; equal scores keep input order.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut suppressed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j]
                && candidates[j].class_id == candidates[i].class_id
                && iou(&candidates[i].bbox, &candidates[j].bbox) >= iou_threshold
            {
                suppressed[j] = true;
            }
        }
        kept.push(candidates[i].clone());
    }
    kept
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Attach class names. Ids outside the label list become `class_<id>`.
pub fn into_detections(candidates: Vec<Candidate>, labels: &[String]) -> Vec<Detection> {
    candidates
        .into_iter()
        .map(|c| {
            let label = labels
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", c.class_id));
            Detection::new(label, c.score, c.bbox)
        })
        .collect()
}
