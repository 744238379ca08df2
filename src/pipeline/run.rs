//! A single pipeline run: the stage state machine plus the `normalize`,
//! `load` and `run_all` entry points.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::loader::{LoadReport, LoaderOptions, UpsertLoader};
use crate::observability::metrics as pipeline_metrics;
use crate::pipeline::artifact;
use crate::pipeline::collector::Collector;
use crate::pipeline::processing::aggregate::to_annual;
use crate::pipeline::processing::normalize::normalize_series;
use crate::pipeline::processing::quality_gate::{
    filter_and_validate, DefaultQualityGate, ExclusionReport, QualityGateConfig, QualitySummary,
};
use crate::pipeline::processing::reshape::{melt, merge, pivot, AnnualSeries, PeriodSeries};
use crate::pipeline::sources::SourceManifest;
use crate::storage::MetricsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Reading,
    Normalizing,
    Aggregating,
    Reshaping,
    Filtering,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Idle => "idle",
            RunStage::Reading => "reading",
            RunStage::Normalizing => "normalizing",
            RunStage::Aggregating => "aggregating",
            RunStage::Reshaping => "reshaping",
            RunStage::Filtering => "filtering",
            RunStage::Writing => "writing",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A run that ended in `Failed`: the stage it was in and the first fatal cause
#[derive(Error, Debug)]
#[error("run failed during {stage}: {error}")]
pub struct RunFailure {
    pub stage: RunStage,
    #[source]
    pub error: PipelineError,
}

/// Tracks the current stage of one run and logs every transition
#[derive(Debug)]
pub struct RunTracker {
    run_id: Uuid,
    stage: RunStage,
    started: Instant,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: RunStage::Idle,
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn advance(&mut self, next: RunStage) {
        info!(run_id = %self.run_id, from = %self.stage, to = %next, "Run stage transition");
        self.stage = next;
    }

    pub fn finish(&mut self) {
        self.advance(RunStage::Done);
        info!(run_id = %self.run_id, elapsed_ms = self.started.elapsed().as_millis() as u64, "Run done");
    }

    /// Move to `Failed`, keeping the stage that failed in the returned error
    pub fn fail(&mut self, error: PipelineError) -> RunFailure {
        let stage = self.stage;
        error!(run_id = %self.run_id, %stage, %error, "Run failed");
        self.stage = RunStage::Failed;
        RunFailure { stage, error }
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-source figures from one normalize run
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub metric: String,
    pub observations: usize,
    pub annual_values: usize,
    pub unparseable_cells: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceSummary>,
    pub rows_written: usize,
    pub exclusions: ExclusionReport,
    pub quality: QualitySummary,
    pub output_path: PathBuf,
    pub fingerprint: String,
}

impl NormalizeReport {
    pub fn unparseable_cells(&self) -> usize {
        self.sources.iter().map(|s| s.unparseable_cells).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunReport {
    pub run_id: Uuid,
    pub load: LoadReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub normalize: NormalizeReport,
    pub load: LoadRunReport,
}

/// Read every manifest source and write the processed dataset.
///
/// Row-level validation failures end up in the exclusion report of a
/// successful run; anything else fails the run at the stage it happened in.
pub fn normalize(
    settings: &Settings,
    manifest: &SourceManifest,
    collector: &dyn Collector,
) -> Result<NormalizeReport, RunFailure> {
    let mut tracker = RunTracker::new();
    let span = info_span!("normalize", run_id = %tracker.run_id(), collector = collector.name());
    let _enter = span.enter();

    tracker.advance(RunStage::Reading);
    manifest.validate().map_err(|e| tracker.fail(e))?;
    let mut raw: Vec<PeriodSeries> = Vec::with_capacity(manifest.sources.len());
    for source in &manifest.sources {
        let table = collector.collect(source).map_err(|e| tracker.fail(e))?;
        let series = melt(source, &table).map_err(|e| tracker.fail(e))?;
        if series.unparseable_cells > 0 {
            pipeline_metrics::sources::unparseable_cells(&source.id, series.unparseable_cells);
        }
        info!(source_id = %source.id, observations = series.observations.len(), "Source read");
        raw.push(series);
    }

    tracker.advance(RunStage::Normalizing);
    let mut normalized = Vec::with_capacity(raw.len());
    for (source, series) in manifest.sources.iter().zip(&raw) {
        normalized.push(normalize_series(source, series).map_err(|e| tracker.fail(e))?);
    }

    tracker.advance(RunStage::Aggregating);
    let mut summaries = Vec::with_capacity(normalized.len());
    let annual: Vec<AnnualSeries> = normalized
        .iter()
        .map(|series| {
            let values = to_annual(&series.observations, series.frequency);
            pipeline_metrics::normalize::observations_produced(&series.source_id, values.len());
            summaries.push(SourceSummary {
                source_id: series.source_id.clone(),
                metric: series.metric.clone(),
                observations: series.observations.len(),
                annual_values: values.len(),
                unparseable_cells: series.unparseable_cells,
            });
            AnnualSeries {
                source_id: series.source_id.clone(),
                metric: series.metric.clone(),
                values,
                names: series.entity_names(),
            }
        })
        .collect();

    tracker.advance(RunStage::Reshaping);
    let long = merge(&annual);
    let wide = pivot(&long).map_err(|e| tracker.fail(e))?;
    info!(observations = long.observations.len(), rows = wide.len(), "Reshaped to one row per entity-year");

    tracker.advance(RunStage::Filtering);
    let gate = DefaultQualityGate::with_config(QualityGateConfig::from_manifest(manifest));
    let outcome = filter_and_validate(&gate, &wide);
    let quality = QualitySummary::from_table(&outcome.table);
    quality.log();

    tracker.advance(RunStage::Writing);
    let fingerprint = artifact::write_atomic(&outcome.table, &settings.output_path).map_err(|e| tracker.fail(e))?;

    tracker.finish();
    Ok(NormalizeReport {
        run_id: tracker.run_id(),
        sources: summaries,
        rows_written: outcome.table.len(),
        exclusions: outcome.exclusions,
        quality,
        output_path: settings.output_path.clone(),
        fingerprint,
    })
}

/// Upsert the processed dataset at `settings.output_path` into `store`
pub async fn load(settings: &Settings, store: Arc<dyn MetricsStore>) -> Result<LoadRunReport, RunFailure> {
    let mut tracker = RunTracker::new();
    info!(run_id = %tracker.run_id(), path = %settings.output_path.display(), "Starting load");

    tracker.advance(RunStage::Reading);
    let table = artifact::read(&settings.output_path).map_err(|e| tracker.fail(e))?;

    tracker.advance(RunStage::Writing);
    let loader = UpsertLoader::new(store, LoaderOptions::from_settings(settings));
    let report = loader.load(&table).await.map_err(|e| tracker.fail(e))?;

    tracker.finish();
    Ok(LoadRunReport {
        run_id: tracker.run_id(),
        load: report,
    })
}

/// `normalize` then `load`; the load never starts if normalize failed
pub async fn run_all(
    settings: &Settings,
    manifest: &SourceManifest,
    collector: &dyn Collector,
    store: Arc<dyn MetricsStore>,
) -> Result<RunReport, RunFailure> {
    let normalized = normalize(settings, manifest, collector)?;
    let loaded = load(settings, store).await?;
    Ok(RunReport {
        normalize: normalized,
        load: loaded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::collector::{CityCollector, CountryCollector};
    use crate::pipeline::sources::SourceSpec;
    use crate::storage::InMemoryStore;
    use std::fs;

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            raw_dir: dir.join("raw"),
            output_path: dir.join("processed").join("country_metrics.csv"),
            ..Settings::default()
        }
    }

    fn manifest() -> SourceManifest {
        SourceManifest::new(vec![SourceSpec::annual("gdp", "gdp.csv", "real_gdp_growth_rate")])
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(RunStage::Reading.to_string(), "reading");
        let mut tracker = RunTracker::new();
        tracker.advance(RunStage::Reshaping);
        let failure = tracker.fail(PipelineError::Configuration("x".into()));
        assert_eq!(failure.stage, RunStage::Reshaping);
        assert_eq!(tracker.stage(), RunStage::Failed);
        assert!(failure.to_string().starts_with("run failed during reshaping"));
    }

    #[test]
    fn test_missing_raw_file_fails_at_reading() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let collector = CountryCollector::new(&settings.raw_dir);
        let failure = normalize(&settings, &manifest(), &collector).unwrap_err();
        assert_eq!(failure.stage, RunStage::Reading);
        assert!(!settings.output_path.exists());
    }

    #[test]
    fn test_city_collector_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let failure = normalize(&settings, &manifest(), &CityCollector::new(Default::default())).unwrap_err();
        assert_eq!(failure.stage, RunStage::Reading);
        assert!(failure.error.to_string().contains("city pipeline is disabled"));
    }

    #[tokio::test]
    async fn test_run_all_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        fs::create_dir_all(&settings.raw_dir).unwrap();
        fs::write(
            settings.raw_dir.join("gdp.csv"),
            "REF_AREA,REF_AREA_LABEL,2014,2018,2019\nXX,Exland,9.9,2.5,\nYY,Whyland,,,\n",
        )
        .unwrap();

        let store = Arc::new(InMemoryStore::new());
        let collector = CountryCollector::new(&settings.raw_dir);
        let report = run_all(&settings, &manifest(), &collector, store.clone()).await.unwrap();

        assert_eq!(report.normalize.rows_written, 1);
        assert!(report.load.load.is_complete());
        let record = store.fetch("XX", 2018).await.unwrap().unwrap();
        assert_eq!(record.metric("real_gdp_growth_rate"), Some(2.5));
        assert!(store.fetch("YY", 2019).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_without_artifact_fails_at_reading() {
        let dir = tempfile::tempdir().unwrap();
        let failure = load(&settings(dir.path()), Arc::new(InMemoryStore::new())).await.unwrap_err();
        assert_eq!(failure.stage, RunStage::Reading);
    }
}
