use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::constants::{ENTITY_CODE_COL, ENTITY_NAME_COL, ENTITY_NAME_MAX_LEN, YEAR_CEILING, YEAR_COL, YEAR_FLOOR};
use crate::domain::{CountryMetricsRow, CountryMetricsTable};
use crate::error::{PipelineError, Result};
use crate::pipeline::sources::SourceManifest;

/// How many rejected keys a report keeps for display
const REJECTION_SAMPLE_SIZE: usize = 10;

/// Declared value domain of a metric column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricDomain {
    /// Any finite number (growth rates, indices with arbitrary base)
    #[default]
    Unbounded,
    /// Rates, counts and ratios: >= 0
    NonNegative,
    /// Percentages and 0-100 scores
    Percentage,
    Bounded { min: f64, max: f64 },
}

impl MetricDomain {
    pub fn validate(&self) -> Result<()> {
        match *self {
            MetricDomain::Bounded { min, max } if !(min <= max) => Err(PipelineError::Configuration(format!(
                "bounded domain has min {min} above max {max}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match *self {
            MetricDomain::Unbounded => true,
            MetricDomain::NonNegative => value >= 0.0,
            MetricDomain::Percentage => (0.0..=100.0).contains(&value),
            MetricDomain::Bounded { min, max } => (min..=max).contains(&value),
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            MetricDomain::Unbounded => "a finite number".to_string(),
            MetricDomain::NonNegative => "non-negative".to_string(),
            MetricDomain::Percentage => "between 0 and 100".to_string(),
            MetricDomain::Bounded { min, max } => format!("between {min} and {max}"),
        }
    }
}

/// Quality Gate decision for a candidate row
#[derive(Debug)]
pub enum QualityDecision {
    /// Row has at least one metric and every populated field is in domain
    Accept,
    /// Every metric is missing; the row is not emitted at all
    DropEmpty,
    /// One or more fields are out of domain; the row is excluded
    Reject(Vec<PipelineError>),
}

/// Trait for implementing row inclusion and validation logic
pub trait QualityGate {
    fn assess(&self, metrics: &[String], row: &CountryMetricsRow) -> QualityDecision;
}

/// Configuration for Quality Gate assessment rules
#[derive(Debug, Clone)]
pub struct QualityGateConfig {
    pub year_floor: i32,
    pub year_ceiling: i32,
    pub name_max_len: usize,
    /// Metrics not listed here are treated as unbounded
    pub domains: HashMap<String, MetricDomain>,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            year_floor: YEAR_FLOOR,
            year_ceiling: YEAR_CEILING,
            name_max_len: ENTITY_NAME_MAX_LEN,
            domains: HashMap::new(),
        }
    }
}

impl QualityGateConfig {
    pub fn from_manifest(manifest: &SourceManifest) -> Self {
        Self {
            domains: manifest
                .sources
                .iter()
                .map(|s| (s.metric.clone(), s.domain))
                .collect(),
            ..Self::default()
        }
    }
}

/// Default Quality Gate implementation with configurable rules
pub struct DefaultQualityGate {
    pub config: QualityGateConfig,
}

impl DefaultQualityGate {
    pub fn new() -> Self {
        Self {
            config: QualityGateConfig::default(),
        }
    }

    pub fn with_config(config: QualityGateConfig) -> Self {
        Self { config }
    }

    fn identity_violations(&self, row: &CountryMetricsRow) -> Vec<PipelineError> {
        let mut violations = Vec::new();
        if row.entity_code.trim().is_empty() {
            violations.push(PipelineError::validation(ENTITY_CODE_COL, "''", "entity code must not be empty"));
        }
        let name_len = row.entity_name.chars().count();
        if name_len == 0 || name_len > self.config.name_max_len {
            violations.push(PipelineError::validation(
                ENTITY_NAME_COL,
                format!("'{}'", row.entity_name),
                format!("entity name must be 1-{} characters", self.config.name_max_len),
            ));
        }
        if row.year < self.config.year_floor || row.year > self.config.year_ceiling {
            violations.push(PipelineError::validation(
                YEAR_COL,
                row.year,
                format!("year must be between {} and {}", self.config.year_floor, self.config.year_ceiling),
            ));
        }
        violations
    }
}

impl Default for DefaultQualityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityGate for DefaultQualityGate {
    fn assess(&self, metrics: &[String], row: &CountryMetricsRow) -> QualityDecision {
        if !row.has_any_metric() {
            return QualityDecision::DropEmpty;
        }

        let mut violations = self.identity_violations(row);
        for (metric, value) in metrics.iter().zip(&row.values) {
            let Some(value) = value else { continue };
            let domain = self.config.domains.get(metric).copied().unwrap_or_default();
            if !domain.contains(*value) {
                violations.push(PipelineError::validation(
                    metric,
                    value,
                    format!("value must be {}", domain.describe()),
                ));
            }
        }

        if violations.is_empty() {
            QualityDecision::Accept
        } else {
            QualityDecision::Reject(violations)
        }
    }
}

/// A row excluded by validation, with every field that failed
#[derive(Debug, Clone, Serialize)]
pub struct RowRejection {
    pub entity_code: String,
    pub year: i32,
    pub violations: Vec<String>,
}

/// Summary of rows left out of the processed dataset
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExclusionReport {
    pub dropped_empty_rows: usize,
    pub excluded_rows: usize,
    pub sample: Vec<RowRejection>,
}

impl ExclusionReport {
    pub fn is_clean(&self) -> bool {
        self.excluded_rows == 0
    }
}

/// Output of the filter stage: the kept rows plus what was left out
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub table: CountryMetricsTable,
    pub exclusions: ExclusionReport,
}

/// Drop all-missing rows and exclude rows failing validation.
/// Produces a new table; processing always continues past a bad row.
pub fn filter_and_validate(gate: &dyn QualityGate, table: &CountryMetricsTable) -> GateOutcome {
    let mut kept = CountryMetricsTable::new(table.metrics.clone());
    let mut exclusions = ExclusionReport::default();

    for row in &table.rows {
        match gate.assess(&table.metrics, row) {
            QualityDecision::Accept => {
                crate::observability::metrics::quality_gate::row_accepted();
                kept.rows.push(row.clone());
            }
            QualityDecision::DropEmpty => {
                crate::observability::metrics::quality_gate::row_dropped_empty();
                exclusions.dropped_empty_rows += 1;
            }
            QualityDecision::Reject(violations) => {
                crate::observability::metrics::quality_gate::row_excluded();
                for violation in &violations {
                    warn!(entity_code = %row.entity_code, year = row.year, "Row excluded: {}", violation);
                }
                exclusions.excluded_rows += 1;
                if exclusions.sample.len() < REJECTION_SAMPLE_SIZE {
                    exclusions.sample.push(RowRejection {
                        entity_code: row.entity_code.clone(),
                        year: row.year,
                        violations: violations.iter().map(ToString::to_string).collect(),
                    });
                }
            }
        }
    }

    info!(
        kept = kept.len(),
        dropped_empty = exclusions.dropped_empty_rows,
        excluded = exclusions.excluded_rows,
        "Quality gate finished"
    );
    GateOutcome { table: kept, exclusions }
}

/// min / max / mean of one populated metric column
#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub metric: String,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Column completeness and value spread of the processed dataset
#[derive(Debug, Clone, Default, Serialize)]
pub struct QualitySummary {
    pub total_rows: usize,
    /// (metric, percent of rows populated)
    pub completeness: Vec<(String, f64)>,
    pub stats: Vec<MetricStats>,
}

impl QualitySummary {
    pub fn from_table(table: &CountryMetricsTable) -> Self {
        let total_rows = table.len();
        let mut summary = QualitySummary {
            total_rows,
            ..Default::default()
        };
        if total_rows == 0 {
            return summary;
        }
        for (idx, metric) in table.metrics.iter().enumerate() {
            let present: Vec<f64> = table.rows.iter().filter_map(|r| r.values[idx]).collect();
            summary
                .completeness
                .push((metric.clone(), present.len() as f64 / total_rows as f64 * 100.0));
            if present.is_empty() {
                continue;
            }
            summary.stats.push(MetricStats {
                metric: metric.clone(),
                min: present.iter().copied().fold(f64::INFINITY, f64::min),
                max: present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                mean: present.iter().sum::<f64>() / present.len() as f64,
            });
        }
        summary
    }

    pub fn log(&self) {
        if self.total_rows == 0 {
            info!("No records to analyse for data quality");
            return;
        }
        info!("Total records processed: {}", self.total_rows);
        for (metric, pct) in &self.completeness {
            info!("Column {} completeness: {:.2}%", metric, pct);
        }
        for s in &self.stats {
            info!("{} stats: min={:.2}, max={:.2}, mean={:.2}", s.metric, s.min, s.max, s.mean);
        }
    }
}
