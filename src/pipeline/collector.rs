use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::config::{LegacyApiCredentials, Settings};
use crate::error::{PipelineError, Result};
use crate::pipeline::sources::SourceSpec;
use crate::table::Table;

pub const COUNTRY_COLLECTOR: &str = "country";
pub const CITY_COLLECTOR: &str = "city";

/// Something that can hand over the raw wide table for a manifest source
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;
    fn collect(&self, source: &SourceSpec) -> Result<Table>;
}

/// Reads one CSV file per source from the raw data directory
pub struct CountryCollector {
    raw_dir: PathBuf,
}

impl CountryCollector {
    pub fn new<P: AsRef<Path>>(raw_dir: P) -> Self {
        Self {
            raw_dir: raw_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, source: &SourceSpec) -> PathBuf {
        self.raw_dir.join(&source.file)
    }
}

impl Collector for CountryCollector {
    fn name(&self) -> &'static str {
        COUNTRY_COLLECTOR
    }

    #[instrument(skip(self, source), fields(source_id = %source.id))]
    fn collect(&self, source: &SourceSpec) -> Result<Table> {
        let path = self.path_for(source);
        if !path.is_file() {
            return Err(PipelineError::Configuration(format!(
                "raw file for source '{}' not found at {}",
                source.id,
                path.display()
            )));
        }
        let table = Table::from_csv_path(&path)?;
        debug!(rows = table.len(), columns = table.columns().len(), "Read raw table");
        crate::observability::metrics::sources::source_read(&source.id);
        Ok(table)
    }
}

/// Retired city-level collection path. Kept behind the same interface so
/// selecting it fails loudly instead of silently producing nothing.
pub struct CityCollector {
    credentials: LegacyApiCredentials,
}

impl CityCollector {
    pub fn new(credentials: LegacyApiCredentials) -> Self {
        Self { credentials }
    }
}

impl Collector for CityCollector {
    fn name(&self) -> &'static str {
        CITY_COLLECTOR
    }

    fn collect(&self, _source: &SourceSpec) -> Result<Table> {
        let configured: Vec<&str> = [
            ("OPENWEATHER_API_KEY", &self.credentials.openweather_api_key),
            ("GEODB_API_KEY", &self.credentials.geodb_api_key),
        ]
        .into_iter()
        .filter(|(_, key)| key.is_some())
        .map(|(name, _)| name)
        .collect();
        if configured.is_empty() {
            return Err(PipelineError::Configuration("city pipeline is disabled".into()));
        }
        Err(PipelineError::Configuration(format!(
            "city pipeline is disabled; {} ignored",
            configured.join(", ")
        )))
    }
}

/// Build a collector by name
pub fn create_collector(name: &str, settings: &Settings) -> Result<Box<dyn Collector>> {
    match name {
        COUNTRY_COLLECTOR => Ok(Box::new(CountryCollector::new(&settings.raw_dir))),
        CITY_COLLECTOR => Ok(Box::new(CityCollector::new(settings.legacy.clone()))),
        other => Err(PipelineError::Configuration(format!("unknown collector '{other}'"))),
    }
}
