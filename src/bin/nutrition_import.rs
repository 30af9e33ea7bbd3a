//! nutrition_import - load nutrition reference rows into SQLite
//!
//! Reads a JSON array of records, normalizes each `food_name` the same way the
//! detector normalizes labels, and upserts them into `food_nutrition_data`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use food_detect::{normalize_label, NutritionRecord, SqliteNutritionStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Import nutrition reference data")]
struct Args {
    /// SQLite database to write (created if missing).
    #[arg(long, env = "FOOD_DETECT_DB_PATH", default_value = "food_nutrition.db")]
    db: String,

    /// JSON file holding an array of nutrition records.
    #[arg(long)]
    input: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let records: Vec<NutritionRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of records", args.input.display()))?;

    let mut normalized = Vec::with_capacity(records.len());
    for mut record in records {
        let name = normalize_label(&record.food_name);
        if name.is_empty() {
            return Err(anyhow!("record with an empty food_name"));
        }
        if name != record.food_name {
            log::debug!("normalized '{}' -> '{}'", record.food_name, name);
        }
        record.food_name = name;
        normalized.push(record);
    }

    let store = SqliteNutritionStore::open(&args.db)?;
    let written = store.upsert_many(&normalized)?;
    log::info!("{} rows in {}", store.count()?, args.db);
    println!("{}", written);
    Ok(())
}
