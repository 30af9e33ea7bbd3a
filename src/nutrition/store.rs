use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use super::{NutritionRecord, NutritionResolver};
use crate::{open_db_connection, open_db_connection_read_only};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const SELECT_COLUMNS: &str =
    "SELECT food_name, calories, protein, carbs, fat, serving_weight_grams FROM food_nutrition_data";

/// SQLite-backed reference store (`food_nutrition_data` table).
///
/// One connection, serialized behind a mutex. Every lookup is bounded by
/// `timeout`: SQLite's busy handler gives up after it, and a lookup whose
/// total time (lock wait included) exceeds it is reported as a failure
/// rather than as a partial result.
pub struct SqliteNutritionStore {
    conn: Mutex<Connection>,
    timeout: Duration,
}

impl SqliteNutritionStore {
    /// Open read-write, creating the table if needed. Used by the import tool
    /// and tests.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open nutrition store {}", db_path))?;
        let store = Self::with_connection(conn, DEFAULT_TIMEOUT)?;
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open read-only for the request path.
    pub fn open_read_only(db_path: &str, timeout: Duration) -> Result<Self> {
        let conn = open_db_connection_read_only(db_path)
            .with_context(|| format!("failed to open nutrition store {} read-only", db_path))?;
        Self::with_connection(conn, timeout)
    }

    fn with_connection(conn: Connection, timeout: Duration) -> Result<Self> {
        conn.busy_timeout(timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
            timeout,
        })
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS food_nutrition_data (
              food_name TEXT PRIMARY KEY NOT NULL,
              calories REAL,
              protein REAL,
              carbs REAL,
              fat REAL,
              serving_weight_grams REAL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("nutrition store lock poisoned"))
    }

    /// Insert or replace records in one transaction. Returns rows written.
    pub fn upsert_many(&self, records: &[NutritionRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO food_nutrition_data(food_name, calories, protein, carbs, fat, serving_weight_grams)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(food_name) DO UPDATE SET
                  calories = excluded.calories,
                  protein = excluded.protein,
                  carbs = excluded.carbs,
                  fat = excluded.fat,
                  serving_weight_grams = excluded.serving_weight_grams
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    record.food_name,
                    record.calories,
                    record.protein,
                    record.carbs,
                    record.fat,
                    record.serving_weight_grams
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM food_nutrition_data", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl NutritionResolver for SqliteNutritionStore {
    fn lookup_many(&self, labels: &BTreeSet<String>) -> Result<HashMap<String, NutritionRecord>> {
        if labels.is_empty() {
            return Ok(HashMap::new());
        }
        let started = Instant::now();

        let placeholders = (1..=labels.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("{} WHERE food_name IN ({})", SELECT_COLUMNS, placeholders);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(labels.iter()), |row| {
            Ok(NutritionRecord {
                food_name: row.get(0)?,
                calories: row.get(1)?,
                protein: row.get(2)?,
                carbs: row.get(3)?,
                fat: row.get(4)?,
                serving_weight_grams: row.get(5)?,
            })
        })?;

        let mut found = HashMap::with_capacity(labels.len());
        for row in rows {
            let record = row?;
            found.insert(record.food_name.clone(), record);
        }

        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            return Err(anyhow!(
                "nutrition lookup took {:?}, over the {:?} limit",
                elapsed,
                self.timeout
            ));
        }
        log::debug!(
            "nutrition lookup: {}/{} labels found in {:?}",
            found.len(),
            labels.len(),
            elapsed
        );
        Ok(found)
    }
}

/// In-memory reference store for tests and embedding.
#[derive(Default)]
pub struct InMemoryNutritionStore {
    records: RwLock<HashMap<String, NutritionRecord>>,
}

impl InMemoryNutritionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = NutritionRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.food_name.clone(), r))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn insert(&self, record: NutritionRecord) -> Result<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| anyhow!("in-memory nutrition store poisoned"))?;
        guard.insert(record.food_name.clone(), record);
        Ok(())
    }
}

impl NutritionResolver for InMemoryNutritionStore {
    fn lookup_many(&self, labels: &BTreeSet<String>) -> Result<HashMap<String, NutritionRecord>> {
        let guard = self
            .records
            .read()
            .map_err(|_| anyhow!("in-memory nutrition store poisoned"))?;
        Ok(labels
            .iter()
            .filter_map(|label| guard.get(label).map(|r| (label.clone(), r.clone())))
            .collect())
    }
}
