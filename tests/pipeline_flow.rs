use anyhow::{anyhow, Result};
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use food_detect::{
    Annotator, Detection, DetectorBackend, DetectorHandle, FoodPipeline, InMemoryNutritionStore,
    NutritionRecord, NutritionResolver, PipelineError, ResolverFailurePolicy,
    SqliteNutritionStore, StubBackend,
};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn rice() -> NutritionRecord {
    NutritionRecord {
        food_name: "Rice".to_string(),
        calories: Some(205.0),
        protein: Some(4.3),
        carbs: Some(44.5),
        fat: Some(0.4),
        serving_weight_grams: Some(158.0),
    }
}

fn pipeline_with(detections: Vec<Detection>, resolver: Arc<dyn NutritionResolver>) -> FoodPipeline {
    FoodPipeline::new(
        DetectorHandle::ready(StubBackend::with_detections(detections)),
        resolver,
        Annotator::default(),
    )
}

/// Counts calls so tests can prove detection never ran.
struct CountingBackend {
    calls: Arc<AtomicUsize>,
}

impl DetectorBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Derives its answer from the image size, so every input has its own
/// expected output: `w % 3 + 1` full-width boxes labelled after the width.
struct SizeEchoBackend;

impl DetectorBackend for SizeEchoBackend {
    fn name(&self) -> &'static str {
        "size-echo"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (w, h) = image.dimensions();
        Ok((0..w % 3 + 1)
            .map(|k| {
                Detection::new(
                    format!("w{}", w),
                    0.9 - k as f32 * 0.1,
                    [k as f32, 0.0, w as f32 + 50.0, h as f32 + 50.0],
                )
            })
            .collect())
    }
}

/// Records every label set it is asked for.
#[derive(Default)]
struct RecordingResolver {
    seen: Mutex<Vec<BTreeSet<String>>>,
}

impl NutritionResolver for RecordingResolver {
    fn lookup_many(&self, labels: &BTreeSet<String>) -> Result<HashMap<String, NutritionRecord>> {
        self.seen.lock().unwrap().push(labels.clone());
        Ok(labels
            .iter()
            .map(|l| (l.clone(), NutritionRecord::named(l.clone())))
            .collect())
    }
}

struct FailingResolver;

impl NutritionResolver for FailingResolver {
    fn lookup_many(&self, _labels: &BTreeSet<String>) -> Result<HashMap<String, NutritionRecord>> {
        Err(anyhow!("database is locked"))
    }
}

#[test]
fn count_matches_predictions_and_nutrition_is_merged() -> Result<()> {
    let pipeline = pipeline_with(
        vec![
            Detection::new("rice", 0.91, [4.0, 4.0, 30.0, 30.0]),
            Detection::new("pizza", 0.55, [10.0, 12.0, 60.0, 40.0]),
        ],
        Arc::new(InMemoryNutritionStore::with_records([rice()])),
    );
    let batch = pipeline.detect_food(&png_bytes(64, 48), "image/png")?;

    assert_eq!(batch.count(), 2);
    assert_eq!(batch.count(), batch.predictions().len());
    assert_eq!(batch.predictions()[0].label, "Rice");
    assert_eq!(batch.predictions()[0].nutrition, Some(rice()));
    assert!(!batch.nutrition_degraded());

    let value = serde_json::to_value(&batch)?;
    assert_eq!(value["count"], 2);
    assert_eq!(value["predictions"][0]["nutrition"]["calories"], 205.0);
    assert_eq!(value["predictions"][0]["box"][2], 30.0);
    // Unknown label serializes as an empty object, never null.
    assert_eq!(value["predictions"][1]["label"], "Pizza");
    assert_eq!(value["predictions"][1]["nutrition"], serde_json::json!({}));
    Ok(())
}

#[test]
fn zero_detections_still_returns_an_image() -> Result<()> {
    let pipeline = pipeline_with(Vec::new(), Arc::new(InMemoryNutritionStore::new()));
    let batch = pipeline.detect_food(&png_bytes(40, 30), "image/png")?;

    assert_eq!(batch.count(), 0);
    assert!(batch.predictions().is_empty());
    let jpeg = base64::engine::general_purpose::STANDARD.decode(batch.image())?;
    let decoded = image::load_from_memory(&jpeg)?;
    assert_eq!((decoded.width(), decoded.height()), (40, 30));
    Ok(())
}

#[test]
fn repeated_labels_are_looked_up_once() -> Result<()> {
    let resolver = Arc::new(RecordingResolver::default());
    let eggs = (0..5)
        .map(|i| Detection::new("egg", 0.9 - i as f32 * 0.1, [i as f32, 0.0, i as f32 + 5.0, 5.0]))
        .collect();
    let pipeline = pipeline_with(eggs, resolver.clone());
    let batch = pipeline.detect_food(&png_bytes(32, 32), "image/png")?;

    assert_eq!(batch.count(), 5);
    let seen = resolver.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].iter().collect::<Vec<_>>(), vec!["Egg"]);
    assert!(batch
        .predictions()
        .iter()
        .all(|d| d.nutrition.as_ref().map(|n| n.food_name.as_str()) == Some("Egg")));
    Ok(())
}

#[test]
fn non_image_content_type_is_rejected_before_detection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = FoodPipeline::new(
        DetectorHandle::ready(CountingBackend {
            calls: calls.clone(),
        }),
        Arc::new(InMemoryNutritionStore::new()),
        Annotator::default(),
    );

    let err = pipeline
        .detect_food(&png_bytes(8, 8), "text/plain")
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedMediaType(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    pipeline.detect_food(&png_bytes(8, 8), "image/png").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn corrupt_bytes_are_an_invalid_image() {
    let pipeline = pipeline_with(Vec::new(), Arc::new(InMemoryNutritionStore::new()));
    let mut bytes = png_bytes(16, 16);
    bytes.truncate(20);

    let err = pipeline.detect_food(&bytes, "image/png").unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
    assert_eq!(err.status_code(), 400);

    let err = pipeline.detect_food(&[], "image/jpeg").unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
}

#[test]
fn unavailable_model_fails_every_request() {
    let pipeline = FoodPipeline::new(
        DetectorHandle::unavailable("weights not found"),
        Arc::new(InMemoryNutritionStore::new()),
        Annotator::default(),
    );
    assert!(!pipeline.model_loaded());

    let err = pipeline.detect_food(&png_bytes(8, 8), "image/png").unwrap_err();
    assert!(matches!(err, PipelineError::ModelUnavailable(_)));
    assert_eq!(err.status_code(), 500);
}

#[test]
fn output_is_deterministic() -> Result<()> {
    let pipeline = pipeline_with(
        vec![
            Detection::new("tofu", 0.7, [2.0, 2.0, 20.0, 20.0]),
            Detection::new("rice", 0.8, [10.0, 10.0, 40.0, 30.0]),
        ],
        Arc::new(InMemoryNutritionStore::with_records([rice()])),
    );
    let bytes = png_bytes(48, 48);
    let a = serde_json::to_string(&pipeline.detect_food(&bytes, "image/png")?)?;
    let b = serde_json::to_string(&pipeline.detect_food(&bytes, "image/png")?)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn concurrent_requests_are_independent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("nutrition.db");
    let db_path = db_path.to_string_lossy().to_string();
    // Only even widths have a reference row.
    let rows: Vec<_> = (0..10u32)
        .filter(|i| i % 2 == 0)
        .map(|i| NutritionRecord {
            food_name: format!("W{}", 20 + i),
            calories: Some((20 + i) as f64),
            ..NutritionRecord::default()
        })
        .collect();
    SqliteNutritionStore::open(&db_path)?.upsert_many(&rows)?;
    let store = SqliteNutritionStore::open_read_only(&db_path, Duration::from_secs(2))?;

    let pipeline = Arc::new(FoodPipeline::new(
        DetectorHandle::ready(SizeEchoBackend),
        Arc::new(store),
        Annotator::default(),
    ));

    let workers: Vec<_> = (0..10u32)
        .map(|i| {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                let (w, h) = (20 + i, 12 + 2 * i);
                let batch = pipeline.detect_food(&png_bytes(w, h), "image/png")?;
                Ok::<_, PipelineError>((i, w, h, batch))
            })
        })
        .collect();

    for worker in workers {
        let (i, w, h, batch) = worker.join().unwrap()?;
        assert_eq!(batch.count(), (w % 3 + 1) as usize, "request {}", i);
        assert_eq!(batch.count(), batch.predictions().len());
        for det in batch.predictions() {
            assert_eq!(det.label, format!("W{}", w));
            assert_eq!(det.bbox[2], w as f32);
            assert_eq!(det.bbox[3], h as f32);
            let calories = det.nutrition.as_ref().and_then(|n| n.calories);
            if i % 2 == 0 {
                assert_eq!(calories, Some(w as f64), "request {}", i);
            } else {
                assert!(det.nutrition.is_none(), "request {}", i);
            }
        }
        let jpeg = base64::engine::general_purpose::STANDARD.decode(batch.image())?;
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (w, h));
    }
    Ok(())
}

#[test]
fn locked_store_times_out_as_resolver_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("nutrition.db");
    let db_path = db_path.to_string_lossy().to_string();
    SqliteNutritionStore::open(&db_path)?.upsert_many(&[rice()])?;

    let holder = rusqlite::Connection::open(&db_path)?;
    holder.execute_batch("BEGIN EXCLUSIVE;")?;

    let store = SqliteNutritionStore::open_read_only(&db_path, Duration::from_millis(200))?;
    let pipeline = pipeline_with(
        vec![Detection::new("rice", 0.9, [1.0, 1.0, 10.0, 10.0])],
        Arc::new(store),
    );

    let started = Instant::now();
    let err = pipeline
        .detect_food(&png_bytes(16, 16), "image/png")
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PipelineError::ResolverFailure(_)), "{:?}", err);
    assert_eq!(err.status_code(), 500);
    // The lookup waited on the lock for roughly the configured timeout.
    assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

    holder.execute_batch("ROLLBACK;")?;
    Ok(())
}

#[test]
fn resolver_failure_fails_the_request_by_default() {
    let pipeline = pipeline_with(
        vec![Detection::new("rice", 0.9, [1.0, 1.0, 10.0, 10.0])],
        Arc::new(FailingResolver),
    );
    let err = pipeline.detect_food(&png_bytes(16, 16), "image/png").unwrap_err();
    assert!(matches!(err, PipelineError::ResolverFailure(_)));
    assert_eq!(err.status_code(), 500);
}

#[test]
fn degrade_policy_returns_detections_without_nutrition() -> Result<()> {
    let pipeline = pipeline_with(
        vec![Detection::new("rice", 0.9, [1.0, 1.0, 10.0, 10.0])],
        Arc::new(FailingResolver),
    )
    .with_resolver_policy(ResolverFailurePolicy::Degrade);
    let batch = pipeline.detect_food(&png_bytes(16, 16), "image/png")?;

    assert_eq!(batch.count(), 1);
    assert!(batch.nutrition_degraded());
    assert!(batch.predictions()[0].nutrition.is_none());
    let value: Value = serde_json::to_value(&batch)?;
    assert_eq!(value["nutrition_degraded"], true);
    Ok(())
}
