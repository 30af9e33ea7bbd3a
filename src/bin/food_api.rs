//! food_api - food detection HTTP service
//!
//! This daemon:
//! 1. Loads the detection model once (degraded, not fatal, on failure)
//! 2. Opens the nutrition reference store read-only
//! 3. Serves `POST /predict/food` until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use food_detect::{
    api::{ApiConfig, ApiServer},
    config::ServiceConfig,
    Annotator, DetectorHandle, FoodPipeline, SqliteNutritionStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;

    let detector = DetectorHandle::load(&config.detector);
    if !detector.is_available() {
        log::warn!("serving without a model; /predict/food will answer 500 until restart");
    }

    let store = SqliteNutritionStore::open_read_only(&config.db_path, config.resolver.timeout)?;
    log::info!("nutrition store opened read-only: {}", config.db_path);

    let annotator = Annotator::new(&config.annotation)?;
    if !annotator.has_font() {
        log::info!("no annotation font configured; labels are drawn without text");
    }

    let pipeline = FoodPipeline::new(detector, Arc::new(store), annotator)
        .with_resolver_policy(config.resolver.on_failure);

    let api_handle = ApiServer::new(ApiConfig::from(&config.api), Arc::new(pipeline)).spawn()?;
    log::info!("food api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("food_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
