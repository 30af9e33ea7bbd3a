use serde::{Serialize, Serializer};

use crate::nutrition::NutritionRecord;

/// `[x1, y1, x2, y2]` in pixel coordinates, with `x1 < x2` and `y1 < y2`.
pub type BoundingBox = [f32; 4];

/// One object instance found in an image.
///
/// Created fresh per request and never persisted here.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Serialized as `{}` when the label is unknown to the reference store.
    #[serde(serialize_with = "serialize_nutrition")]
    pub nutrition: Option<NutritionRecord>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            nutrition: None,
        }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    /// Clamp the box into a `width` x `height` image.
    ///
    /// Returns `None` when nothing with positive area is left.
    pub fn clamped_to(mut self, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        self.bbox = [
            self.bbox[0].clamp(0.0, w),
            self.bbox[1].clamp(0.0, h),
            self.bbox[2].clamp(0.0, w),
            self.bbox[3].clamp(0.0, h),
        ];
        if self.bbox.iter().all(|v| v.is_finite()) && self.width() > 0.0 && self.height() > 0.0 {
            Some(self)
        } else {
            None
        }
    }
}

fn serialize_nutrition<S: Serializer>(
    nutrition: &Option<NutritionRecord>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match nutrition {
        Some(record) => record.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_nutrition_serializes_as_empty_object() {
        let det = Detection::new("Rice", 0.5, [1.0, 2.0, 3.0, 4.0]);
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["label"], "Rice");
        assert_eq!(value["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(value["nutrition"], serde_json::json!({}));
    }

    #[test]
    fn clamping_drops_degenerate_boxes() {
        let inside = Detection::new("Egg", 0.9, [-5.0, 2.0, 50.0, 90.0])
            .clamped_to(40, 30)
            .unwrap();
        assert_eq!(inside.bbox, [0.0, 2.0, 40.0, 30.0]);

        assert!(Detection::new("Egg", 0.9, [45.0, 0.0, 60.0, 10.0])
            .clamped_to(40, 30)
            .is_none());
        assert!(Detection::new("Egg", 0.9, [5.0, 5.0, 5.0, 10.0])
            .clamped_to(40, 30)
            .is_none());
    }
}
