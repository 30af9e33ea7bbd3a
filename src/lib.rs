//! Food Detection Service
//!
//! Accepts a food photo, runs an object-detection model over it, resolves the
//! detected food labels against a nutrition reference table and returns the
//! detections, their nutrition facts and an annotated copy of the photo in one
//! synchronous request/response cycle.
//!
//! # Request flow
//!
//! decode -> detect -> resolve nutrition -> merge -> annotate -> encode -> respond
//!
//! Nothing is shared between requests except the model loaded once at startup
//! (behind [`DetectorHandle`]) and a read path to the nutrition store.
//!
//! # Module Structure
//!
//! - `frame`: Content-type gate and image decoding
//! - `detect`: Detection records, detector backends, YOLO output decoding
//! - `nutrition`: Nutrition records and the batched reference lookup
//! - `annotate`: Box/label rendering and JPEG + base64 transport encoding
//! - `pipeline`: The `detect_food` orchestrator
//! - `api`: HTTP boundary (`POST /predict/food`)

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod labels;
pub mod nutrition;
pub mod pipeline;

pub use annotate::Annotator;
pub use detect::{Detection, DetectorBackend, DetectorHandle, StubBackend};
pub use error::PipelineError;
pub use labels::normalize_label;
pub use nutrition::{
    InMemoryNutritionStore, NutritionRecord, NutritionResolver, SqliteNutritionStore,
};
pub use pipeline::{DetectionBatch, FoodPipeline, ResolverFailurePolicy};

// -------------------- SQLite helpers --------------------

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// URI for a named, shared-cache in-memory database.
///
/// Every call yields a distinct database; connections opened on the same URI
/// see the same tables for as long as one of them stays open.
pub fn shared_memory_uri() -> String {
    let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "file:food_detect_{:x}_{:x}_{:x}?mode=memory&cache=shared",
        std::process::id(),
        nanos,
        seq
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn open_db_connection_read_only(db_path: &str) -> Result<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if db_path.starts_with("file:") {
        flags |= OpenFlags::SQLITE_OPEN_URI;
    }
    Ok(Connection::open_with_flags(db_path, flags)?)
}
