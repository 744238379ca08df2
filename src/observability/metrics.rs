//! Counter and histogram names for the country metrics pipeline.
//!
//! Recording goes through the `metrics` facade; with no recorder installed
//! every call is a no-op, so library users opt in by installing their own.

use std::fmt;

/// Every metric name emitted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Reading
    SourcesRead,
    SourcesUnparseableCells,

    // Normalize
    NormalizeObservationsProduced,
    NormalizeValuesClipped,

    // Quality gate
    QualityGateRowsAccepted,
    QualityGateRowsDroppedEmpty,
    QualityGateRowsExcluded,

    // Loader
    LoaderBatchesCommitted,
    LoaderBatchesFailed,
    LoaderRetries,
    LoaderRowsWritten,
    LoaderBatchDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::SourcesRead => "country_metrics_sources_read_total",
            MetricName::SourcesUnparseableCells => "country_metrics_sources_unparseable_cells_total",
            MetricName::NormalizeObservationsProduced => "country_metrics_normalize_observations_total",
            MetricName::NormalizeValuesClipped => "country_metrics_normalize_values_clipped_total",
            MetricName::QualityGateRowsAccepted => "country_metrics_quality_gate_rows_accepted_total",
            MetricName::QualityGateRowsDroppedEmpty => "country_metrics_quality_gate_rows_dropped_empty_total",
            MetricName::QualityGateRowsExcluded => "country_metrics_quality_gate_rows_excluded_total",
            MetricName::LoaderBatchesCommitted => "country_metrics_loader_batches_committed_total",
            MetricName::LoaderBatchesFailed => "country_metrics_loader_batches_failed_total",
            MetricName::LoaderRetries => "country_metrics_loader_retries_total",
            MetricName::LoaderRowsWritten => "country_metrics_loader_rows_written_total",
            MetricName::LoaderBatchDuration => "country_metrics_loader_batch_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Reading Metrics
// ============================================================================

pub mod sources {
    use super::MetricName;

    pub fn source_read(source_id: &str) {
        ::metrics::counter!(MetricName::SourcesRead.as_str(), "source" => source_id.to_string()).increment(1);
    }

    pub fn unparseable_cells(source_id: &str, count: usize) {
        ::metrics::counter!(MetricName::SourcesUnparseableCells.as_str(), "source" => source_id.to_string())
            .increment(count as u64);
    }
}

// ============================================================================
// Normalize Metrics
// ============================================================================

pub mod normalize {
    use super::MetricName;

    /// Record annual observations produced for one source
    pub fn observations_produced(source_id: &str, count: usize) {
        ::metrics::counter!(MetricName::NormalizeObservationsProduced.as_str(), "source" => source_id.to_string())
            .increment(count as u64);
    }

    /// Record values clamped to an outlier bound
    pub fn values_clipped(source_id: &str, count: usize) {
        ::metrics::counter!(MetricName::NormalizeValuesClipped.as_str(), "source" => source_id.to_string())
            .increment(count as u64);
    }
}

// ============================================================================
// Quality Gate Metrics
// ============================================================================

pub mod quality_gate {
    use super::MetricName;

    pub fn row_accepted() {
        ::metrics::counter!(MetricName::QualityGateRowsAccepted.as_str()).increment(1);
    }

    pub fn row_dropped_empty() {
        ::metrics::counter!(MetricName::QualityGateRowsDroppedEmpty.as_str()).increment(1);
    }

    pub fn row_excluded() {
        ::metrics::counter!(MetricName::QualityGateRowsExcluded.as_str()).increment(1);
    }
}

// ============================================================================
// Loader Metrics
// ============================================================================

pub mod loader {
    use super::MetricName;

    /// Record a committed batch and how long it took end to end
    pub fn batch_committed(rows: usize, secs: f64) {
        ::metrics::counter!(MetricName::LoaderBatchesCommitted.as_str()).increment(1);
        ::metrics::counter!(MetricName::LoaderRowsWritten.as_str()).increment(rows as u64);
        ::metrics::histogram!(MetricName::LoaderBatchDuration.as_str()).record(secs);
    }

    pub fn batch_failed(reason: &str) {
        ::metrics::counter!(MetricName::LoaderBatchesFailed.as_str(), "reason" => reason.to_string()).increment(1);
    }

    pub fn retry_attempted(operation: &str) {
        ::metrics::counter!(MetricName::LoaderRetries.as_str(), "operation" => operation.to_string()).increment(1);
    }
}
