//! detect_image - run the detection pipeline on one local image
//!
//! Prints the detection batch as JSON (without the base64 image) and can write
//! the annotated JPEG next to it.

use anyhow::{Context, Result};
use base64::Engine;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use food_detect::{
    config::ServiceConfig, frame::content_type_for_path, Annotator, DetectorHandle, FoodPipeline,
    InMemoryNutritionStore, NutritionResolver, SqliteNutritionStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect food in a local image")]
struct Args {
    /// Image to analyse.
    #[arg(long)]
    image: PathBuf,

    /// Nutrition database (defaults to the configured path).
    #[arg(long)]
    db: Option<String>,

    /// Skip the nutrition store entirely.
    #[arg(long)]
    no_nutrition: bool,

    /// Write the annotated JPEG here.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = ServiceConfig::load()?;

    let resolver: Arc<dyn NutritionResolver> = if args.no_nutrition {
        Arc::new(InMemoryNutritionStore::new())
    } else {
        let db = args.db.as_deref().unwrap_or(&config.db_path);
        Arc::new(SqliteNutritionStore::open_read_only(db, config.resolver.timeout)?)
    };
    let pipeline = FoodPipeline::new(
        DetectorHandle::load(&config.detector),
        resolver,
        Annotator::new(&config.annotation)?,
    )
    .with_resolver_policy(config.resolver.on_failure);

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let batch = pipeline.detect_food(&bytes, content_type_for_path(&args.image))?;

    let mut summary = serde_json::to_value(&batch)?;
    if let Some(obj) = summary.as_object_mut() {
        obj.remove("image");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(out) = &args.out {
        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(batch.image())
            .context("annotated image is not valid base64")?;
        std::fs::write(out, jpeg).with_context(|| format!("failed to write {}", out.display()))?;
        log::info!("annotated image written to {}", out.display());
    }
    Ok(())
}
