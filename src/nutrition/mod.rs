//! Nutrition reference data and the batched label lookup.
//!
//! The pipeline only ever reads from the reference store. Writes happen
//! through the import tool, never from a request path.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

mod store;

pub use store::{InMemoryNutritionStore, SqliteNutritionStore};

/// Reference nutrition facts for one food, keyed by normalized food name.
///
/// Every nutrition field is nullable; partially known foods are stored as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NutritionRecord {
    pub food_name: String,
    #[serde(default)]
    pub calories: Option<f64>,
    #[serde(default)]
    pub protein: Option<f64>,
    #[serde(default)]
    pub carbs: Option<f64>,
    #[serde(default)]
    pub fat: Option<f64>,
    #[serde(default)]
    pub serving_weight_grams: Option<f64>,
}

impl NutritionRecord {
    pub fn named(food_name: impl Into<String>) -> Self {
        Self {
            food_name: food_name.into(),
            ..Self::default()
        }
    }
}

/// Batch lookup of nutrition facts by label.
///
/// Implementations answer the whole set in one round trip. Labels absent
/// from the store are simply absent from the returned map; that is not an
/// error. An `Err` means the store itself failed (unreachable, timed out).
pub trait NutritionResolver: Send + Sync {
    fn lookup_many(&self, labels: &BTreeSet<String>) -> Result<HashMap<String, NutritionRecord>>;
}
