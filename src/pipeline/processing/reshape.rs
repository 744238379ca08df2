//! Wide-to-long reshaping, outer merge across metrics, and the final pivot
//! back to one wide row per (entity_code, year).

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::constants::YEAR_FLOOR;
use crate::domain::{AnnualObservation, CountryMetricsRow, CountryMetricsTable, Frequency, Period};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::aggregate::AnnualValues;
use crate::pipeline::sources::SourceSpec;
use crate::table::{Cell, Table};

/// One cell of a wide source table after its header has been parsed
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub entity_code: String,
    pub entity_name: String,
    pub period: Period,
    pub value: Option<f64>,
}

/// A source in long form, still at its native frequency
#[derive(Debug, Clone)]
pub struct PeriodSeries {
    pub source_id: String,
    pub metric: String,
    pub frequency: Frequency,
    pub observations: Vec<RawObservation>,
    /// Non-empty cells that were not numbers; read as absent
    pub unparseable_cells: usize,
}

impl PeriodSeries {
    pub fn values(&self) -> Vec<Option<f64>> {
        self.observations.iter().map(|o| o.value).collect()
    }

    /// Same series carrying new values, one per observation in order
    pub fn with_values(&self, values: Vec<Option<f64>>) -> PeriodSeries {
        let observations = self
            .observations
            .iter()
            .zip(values)
            .map(|(obs, value)| RawObservation { value, ..obs.clone() })
            .collect();
        PeriodSeries {
            observations,
            ..self.clone()
        }
    }

    /// First non-empty display name seen per entity code
    pub fn entity_names(&self) -> BTreeMap<String, String> {
        let mut names = BTreeMap::new();
        for obs in &self.observations {
            if !obs.entity_name.is_empty() {
                names.entry(obs.entity_code.clone()).or_insert_with(|| obs.entity_name.clone());
            }
        }
        names
    }
}

/// A metric reduced to annual values, ready to merge
#[derive(Debug, Clone)]
pub struct AnnualSeries {
    pub source_id: String,
    pub metric: String,
    pub values: AnnualValues,
    pub names: BTreeMap<String, String>,
}

/// Unified long table: one observation per (entity_code, year, metric)
#[derive(Debug, Clone, Default)]
pub struct LongTable {
    pub metrics: Vec<String>,
    pub observations: Vec<AnnualObservation>,
}

/// Turn a wide source table into period observations.
///
/// Applies the source's row filters, locates the entity columns, parses every
/// period header and discards periods before the year floor.
pub fn melt(source: &SourceSpec, table: &Table) -> Result<PeriodSeries> {
    let mut filtered = table.clone();
    for filter in &source.filters {
        let idx = filtered
            .column_index(&filter.column)
            .ok_or_else(|| PipelineError::schema(&source.id, &filter.column, "filter column not found"))?;
        filtered = filtered.filter(|row| row[idx].as_str() == Some(filter.equals.as_str()));
    }

    let code_idx = filtered
        .find_column(&source.code_columns)
        .ok_or_else(|| PipelineError::schema(&source.id, &source.code_columns.join("|"), "entity code column not found"))?;
    let name_idx = filtered
        .find_column(&source.name_columns)
        .ok_or_else(|| PipelineError::schema(&source.id, &source.name_columns.join("|"), "entity name column not found"))?;

    let mut periods = Vec::new();
    for (idx, header) in filtered.columns().iter().enumerate() {
        if let Some(period) = Period::parse(&source.id, header, source.frequency)? {
            periods.push((idx, period));
        }
    }
    if periods.is_empty() {
        return Err(PipelineError::schema(&source.id, "*", "no period columns found"));
    }
    periods.retain(|(_, p)| p.year() >= YEAR_FLOOR);

    let mut observations = Vec::new();
    let mut unparseable_cells = 0usize;
    for cells in filtered.rows() {
        let Some(entity_code) = cells[code_idx].as_str() else {
            continue;
        };
        let entity_name = cells[name_idx].render();
        for (idx, period) in &periods {
            let value = match &cells[*idx] {
                Cell::Missing => None,
                cell => {
                    let parsed = cell.as_f64();
                    if parsed.is_none() {
                        unparseable_cells += 1;
                    }
                    parsed
                }
            };
            observations.push(RawObservation {
                entity_code: entity_code.to_string(),
                entity_name: entity_name.clone(),
                period: *period,
                value,
            });
        }
    }

    if unparseable_cells > 0 {
        warn!(source_id = %source.id, unparseable_cells, "Non-numeric cells read as absent");
    }
    debug!(
        source_id = %source.id,
        rows = filtered.len(),
        periods = periods.len(),
        observations = observations.len(),
        "Melted source"
    );

    Ok(PeriodSeries {
        source_id: source.id.clone(),
        metric: source.metric.clone(),
        frequency: source.frequency,
        observations,
        unparseable_cells,
    })
}

/// Outer-merge annual series on (entity_code, year).
///
/// Every key present in any series gets one observation per metric; a metric
/// that lacks the key contributes an absent value instead of dropping the key.
/// Entity names come from the first series, in order, that names the entity.
pub fn merge(series: &[AnnualSeries]) -> LongTable {
    let metrics: Vec<String> = series.iter().map(|s| s.metric.clone()).collect();

    let mut names: BTreeMap<&str, &str> = BTreeMap::new();
    for s in series {
        for (code, name) in &s.names {
            names.entry(code.as_str()).or_insert(name.as_str());
        }
    }

    let keys: BTreeSet<&(String, i32)> = series
        .iter()
        .flat_map(|s| s.values.keys())
        .filter(|(_, year)| *year >= YEAR_FLOOR)
        .collect();

    let mut observations = Vec::with_capacity(keys.len() * series.len());
    for key in keys {
        let (code, year) = key;
        let entity_name = names.get(code.as_str()).copied().unwrap_or_default();
        for s in series {
            observations.push(AnnualObservation {
                entity_code: code.clone(),
                entity_name: entity_name.to_string(),
                year: *year,
                metric: s.metric.clone(),
                value: s.values.get(key).copied(),
            });
        }
    }

    LongTable { metrics, observations }
}

/// Pivot the long table into one wide row per (entity_code, year), sorted by key
pub fn pivot(long: &LongTable) -> Result<CountryMetricsTable> {
    let width = long.metrics.len();
    let mut rows: BTreeMap<(String, i32), CountryMetricsRow> = BTreeMap::new();
    let mut seen: BTreeSet<(String, i32, usize)> = BTreeSet::new();

    for obs in &long.observations {
        let idx = long
            .metrics
            .iter()
            .position(|m| *m == obs.metric)
            .ok_or_else(|| PipelineError::schema("long table", &obs.metric, "metric not declared"))?;
        if !seen.insert((obs.entity_code.clone(), obs.year, idx)) {
            return Err(PipelineError::schema(
                "long table",
                &obs.metric,
                format!("duplicate observation for ({}, {})", obs.entity_code, obs.year),
            ));
        }
        let row = rows
            .entry((obs.entity_code.clone(), obs.year))
            .or_insert_with(|| CountryMetricsRow {
                entity_code: obs.entity_code.clone(),
                entity_name: obs.entity_name.clone(),
                year: obs.year,
                values: vec![None; width],
            });
        row.values[idx] = obs.value;
    }

    Ok(CountryMetricsTable {
        metrics: long.metrics.clone(),
        rows: rows.into_values().collect(),
    })
}
