//! Upsert loader: writes the processed table into a [`MetricsStore`] in
//! transactional batches keyed by (entity_code, year).

use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Settings;
use crate::constants::is_reserved_column;
use crate::domain::CountryMetricsTable;
use crate::error::{PipelineError, Result};
use crate::observability::metrics::loader as loader_metrics;
use crate::pipeline::sources::is_sql_identifier;
use crate::storage::{MetricsStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl LoaderOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_retries: settings.max_retries,
            retry_base: settings.retry_base,
        }
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A batch that was rolled back; the rows it held were not written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub entity_code: Option<String>,
    pub year: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub rows_in_dataset: usize,
    pub rows_written: usize,
    pub batches_committed: usize,
    pub failed_batches: Vec<BatchFailure>,
    /// Every dataset key from a committed batch is present in the store
    pub verified: bool,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty() && self.rows_written == self.rows_in_dataset && self.verified
    }
}

pub struct UpsertLoader {
    store: Arc<dyn MetricsStore>,
    options: LoaderOptions,
}

impl UpsertLoader {
    /// A zero batch size is treated as one row per batch
    pub fn new(store: Arc<dyn MetricsStore>, mut options: LoaderOptions) -> Self {
        options.batch_size = options.batch_size.max(1);
        Self { store, options }
    }

    /// Make sure every row of `table` is in the store with current values.
    ///
    /// Rejected batches are reported and skipped; batches committed before a
    /// fatal error stay committed.
    #[instrument(skip(self, table), fields(rows = table.len(), batch_size = self.options.batch_size))]
    pub async fn load(&self, table: &CountryMetricsTable) -> Result<LoadReport> {
        validate_columns(&table.metrics)?;
        warn_on_duplicate_keys(table);

        let metrics = table.metrics.clone();
        self.with_retry("ensure_schema", || self.store.ensure_schema(&metrics))
            .await
            .map_err(|e| PipelineError::storage(format!("schema bootstrap failed: {e}")))?;

        let mut report = LoadReport {
            rows_in_dataset: table.len(),
            ..Default::default()
        };
        let mut committed_keys = BTreeSet::new();

        for (batch_index, batch) in table.rows.chunks(self.options.batch_size).enumerate() {
            let started = Instant::now();
            match self
                .with_retry("upsert_batch", || self.store.upsert_batch(&metrics, batch))
                .await
            {
                Ok(written) => {
                    report.rows_written += written;
                    report.batches_committed += 1;
                    committed_keys.extend(batch.iter().map(|r| (r.entity_code.clone(), r.year)));
                    loader_metrics::batch_committed(written, started.elapsed().as_secs_f64());
                    debug!(batch_index, rows = written, "Batch committed");
                }
                Err(StoreError::Rejected {
                    entity_code,
                    year,
                    message,
                }) => {
                    warn!(batch_index, %entity_code, year, %message, "Batch rejected; continuing with next batch");
                    loader_metrics::batch_failed("rejected");
                    report.failed_batches.push(BatchFailure {
                        batch_index,
                        entity_code: Some(entity_code),
                        year: Some(year),
                        message,
                    });
                }
                Err(StoreError::Fatal(message)) => {
                    warn!(batch_index, %message, "Batch failed; continuing with next batch");
                    loader_metrics::batch_failed("fatal");
                    report.failed_batches.push(BatchFailure {
                        batch_index,
                        entity_code: None,
                        year: None,
                        message,
                    });
                }
                Err(StoreError::Transient(message)) => {
                    loader_metrics::batch_failed("unreachable");
                    error!(batch_index, rows_written = report.rows_written, %message, "Store unreachable after retries");
                    return Err(PipelineError::storage(format!(
                        "store unreachable at batch {batch_index} after {} retries ({} rows already committed): {message}",
                        self.options.max_retries, report.rows_written
                    )));
                }
            }
        }

        let stored = self
            .with_retry("existing_keys", || self.store.existing_keys())
            .await
            .map_err(PipelineError::from)?;
        report.verified = committed_keys.is_subset(&stored);
        if !report.verified {
            warn!("Post-load check failed: committed keys missing from store");
        }

        info!(
            rows_written = report.rows_written,
            batches_committed = report.batches_committed,
            failed_batches = report.failed_batches.len(),
            verified = report.verified,
            "Load finished"
        );
        Ok(report)
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(StoreError::Transient(message)) if attempt < self.options.max_retries => {
                    let delay = self.options.retry_base.saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    loader_metrics::retry_attempted(operation);
                    warn!(operation, attempt, delay_ms = delay.as_millis() as u64, %message, "Transient storage error, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn validate_columns(metrics: &[String]) -> Result<()> {
    for metric in metrics {
        if !is_sql_identifier(metric) || is_reserved_column(metric) {
            return Err(PipelineError::schema(
                "processed dataset",
                metric,
                "metric column is not a usable store column name",
            ));
        }
    }
    Ok(())
}

fn warn_on_duplicate_keys(table: &CountryMetricsTable) {
    let mut seen = BTreeSet::new();
    let duplicates = table
        .rows
        .iter()
        .filter(|r| !seen.insert((r.entity_code.as_str(), r.year)))
        .count();
    if duplicates > 0 {
        warn!(duplicates, "Processed dataset repeats keys; the last occurrence wins");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CountryMetricsRow;
    use crate::storage::InMemoryStore;

    fn table(rows: &[(&str, i32, Option<f64>)]) -> CountryMetricsTable {
        let mut table = CountryMetricsTable::new(vec!["life_expectancy_years".into()]);
        table.rows = rows
            .iter()
            .map(|(code, year, value)| CountryMetricsRow {
                entity_code: code.to_string(),
                entity_name: format!("{code} name"),
                year: *year,
                values: vec![*value],
            })
            .collect();
        table
    }

    fn options(batch_size: usize) -> LoaderOptions {
        LoaderOptions {
            batch_size,
            max_retries: 2,
            retry_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_load_writes_all_rows_in_batches() {
        let store = Arc::new(InMemoryStore::new());
        let loader = UpsertLoader::new(store.clone(), options(2));
        let report = loader
            .load(&table(&[("FRA", 2019, Some(82.0)), ("FRA", 2020, Some(82.1)), ("DEU", 2020, None)]))
            .await
            .unwrap();
        assert_eq!(report.batches_committed, 2);
        assert_eq!(report.rows_written, 3);
        assert!(report.is_complete());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_batch_size_loads_row_by_row() {
        let store = Arc::new(InMemoryStore::new());
        let loader = UpsertLoader::new(store.clone(), options(0));
        let report = loader
            .load(&table(&[("FRA", 2019, Some(82.0)), ("DEU", 2020, None)]))
            .await
            .unwrap();
        assert_eq!(report.batches_committed, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_batch_does_not_undo_others() {
        let store = Arc::new(InMemoryStore::new());
        let loader = UpsertLoader::new(store.clone(), options(1));
        let report = loader
            .load(&table(&[("FRA", 2020, Some(82.1)), ("", 2020, Some(1.0)), ("DEU", 2020, Some(81.0))]))
            .await
            .unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].batch_index, 1);
        assert!(report.verified);
        assert!(!report.is_complete());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_writes(2);
        let loader = UpsertLoader::new(store.clone(), options(10));
        let report = loader.load(&table(&[("FRA", 2020, Some(82.1))])).await.unwrap();
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_load() {
        let store = Arc::new(InMemoryStore::new());
        store.ensure_schema(&["life_expectancy_years".to_string()]).await.unwrap();
        store.fail_next_writes(10);
        let loader = UpsertLoader::new(store.clone(), options(10));
        let err = loader.load(&table(&[("FRA", 2020, Some(82.1))])).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_schema_bootstrap() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unreachable(true);
        let loader = UpsertLoader::new(store, options(10));
        let err = loader.load(&table(&[("FRA", 2020, Some(82.1))])).await.unwrap_err();
        assert!(err.to_string().contains("schema bootstrap"));
    }

    #[tokio::test]
    async fn test_bad_metric_column_is_schema_error() {
        let mut bad = table(&[("FRA", 2020, Some(82.1))]);
        bad.metrics = vec!["created_at".into()];
        let loader = UpsertLoader::new(Arc::new(InMemoryStore::new()), options(10));
        assert!(matches!(loader.load(&bad).await, Err(PipelineError::Schema { .. })));
    }
}
