use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::constants::YEAR_FLOOR;
use crate::domain::CountryMetricsRow;
use crate::error::PipelineError;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// How a store call failed, which decides what the loader does next
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connectivity or lock contention; worth retrying
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// A row in the batch violated a constraint; the batch was rolled back
    #[error("row ({entity_code}, {year}) rejected: {message}")]
    Rejected {
        entity_code: String,
        year: i32,
        message: String,
    },

    #[error("storage failure: {0}")]
    Fatal(String),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::storage(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored row plus its audit columns
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub entity_code: String,
    pub entity_name: String,
    pub iso3: Option<String>,
    pub year: i32,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }
}

/// Persistent home of the country metrics table, keyed by (entity_code, year)
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Create the table if absent and add any missing metric columns
    async fn ensure_schema(&self, metrics: &[String]) -> StoreResult<()>;

    /// Insert-or-replace every row in one transaction; all or nothing
    async fn upsert_batch(&self, metrics: &[String], rows: &[CountryMetricsRow]) -> StoreResult<usize>;

    async fn fetch(&self, entity_code: &str, year: i32) -> StoreResult<Option<PersistedRecord>>;

    async fn count(&self) -> StoreResult<usize>;

    async fn existing_keys(&self) -> StoreResult<BTreeSet<(String, i32)>>;
}

#[derive(Default)]
struct MemoryState {
    columns: Option<Vec<String>>,
    records: BTreeMap<(String, i32), PersistedRecord>,
}

/// In-memory store with the same constraints as the SQL table.
///
/// Failure injection lets tests exercise the loader's retry and
/// batch-isolation paths without a real database.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    fail_next: AtomicUsize,
    unreachable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a transient error
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every call fails with a transient error while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store unreachable".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Fatal("store lock poisoned".into()))
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn check_row(row: &CountryMetricsRow) -> StoreResult<()> {
    let reject = |message: &str| StoreError::Rejected {
        entity_code: row.entity_code.clone(),
        year: row.year,
        message: message.to_string(),
    };
    if row.entity_code.is_empty() {
        return Err(reject("CHECK constraint failed: entity_code must not be empty"));
    }
    if row.year < YEAR_FLOOR {
        return Err(reject(&format!("CHECK constraint failed: year >= {YEAR_FLOOR}")));
    }
    Ok(())
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn ensure_schema(&self, metrics: &[String]) -> StoreResult<()> {
        let mut state = self.state()?;
        let columns = state.columns.get_or_insert_with(Vec::new);
        for metric in metrics {
            if !columns.contains(metric) {
                columns.push(metric.clone());
            }
        }
        Ok(())
    }

    async fn upsert_batch(&self, metrics: &[String], rows: &[CountryMetricsRow]) -> StoreResult<usize> {
        let mut state = self.state()?;
        if self.take_injected_failure() {
            return Err(StoreError::Transient("injected transient failure".into()));
        }
        let columns = state
            .columns
            .clone()
            .ok_or_else(|| StoreError::Fatal("table country_metrics does not exist".into()))?;
        if let Some(unknown) = metrics.iter().find(|m| !columns.contains(m)) {
            return Err(StoreError::Fatal(format!("table country_metrics has no column named {unknown}")));
        }
        // checked up front so a rejected batch leaves nothing behind
        for row in rows {
            check_row(row)?;
        }

        let now = Utc::now();
        for row in rows {
            let key = (row.entity_code.clone(), row.year);
            let record = state.records.entry(key).or_insert_with(|| PersistedRecord {
                entity_code: row.entity_code.clone(),
                entity_name: String::new(),
                iso3: None,
                year: row.year,
                metrics: columns.iter().map(|c| (c.clone(), None)).collect(),
                created_at: now,
                updated_at: now,
            });
            record.entity_name = row.entity_name.clone();
            record.iso3 = row.iso3();
            // stored columns absent from this dataset are cleared, not merged
            for column in &columns {
                record.metrics.insert(column.clone(), None);
            }
            for (metric, value) in metrics.iter().zip(&row.values) {
                record.metrics.insert(metric.clone(), *value);
            }
            record.updated_at = now;
        }
        debug!(rows = rows.len(), "Upserted batch into memory store");
        Ok(rows.len())
    }

    async fn fetch(&self, entity_code: &str, year: i32) -> StoreResult<Option<PersistedRecord>> {
        let state = self.state()?;
        Ok(state.records.get(&(entity_code.to_string(), year)).cloned())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.state()?.records.len())
    }

    async fn existing_keys(&self) -> StoreResult<BTreeSet<(String, i32)>> {
        Ok(self.state()?.records.keys().cloned().collect())
    }
}
