use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::constants::{is_reserved_column, DEFAULT_CODE_COLUMNS, DEFAULT_NAME_COLUMNS};
use crate::domain::Frequency;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::normalize::{OutlierClip, Scale};
use crate::pipeline::processing::quality_gate::MetricDomain;

static SQL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").unwrap());

const REFERENCE_MANIFEST: &str = include_str!("../../config/sources.toml");

/// Whether `name` can be used verbatim as a column name in the store
pub fn is_sql_identifier(name: &str) -> bool {
    SQL_IDENTIFIER.is_match(name)
}

/// Keep only raw rows whose `column` equals `equals`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub equals: String,
}

/// One raw source file and how to read it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub file: String,
    pub metric: String,
    pub frequency: Frequency,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default)]
    pub clip: Option<OutlierClip>,
    #[serde(default)]
    pub domain: MetricDomain,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default = "default_code_columns")]
    pub code_columns: Vec<String>,
    #[serde(default = "default_name_columns")]
    pub name_columns: Vec<String>,
}

fn default_code_columns() -> Vec<String> {
    DEFAULT_CODE_COLUMNS.iter().map(|c| c.to_string()).collect()
}

fn default_name_columns() -> Vec<String> {
    DEFAULT_NAME_COLUMNS.iter().map(|c| c.to_string()).collect()
}

impl SourceSpec {
    /// Annual source with default entity columns, identity scale and no domain
    pub fn annual(id: &str, file: &str, metric: &str) -> Self {
        Self {
            id: id.to_string(),
            file: file.to_string(),
            metric: metric.to_string(),
            frequency: Frequency::Annual,
            scale: Scale::Identity,
            clip: None,
            domain: MetricDomain::Unbounded,
            filters: Vec::new(),
            code_columns: default_code_columns(),
            name_columns: default_name_columns(),
        }
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_clip(mut self, clip: OutlierClip) -> Self {
        self.clip = Some(clip);
        self
    }

    pub fn with_domain(mut self, domain: MetricDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_filter(mut self, column: &str, equals: &str) -> Self {
        self.filters.push(RowFilter {
            column: column.to_string(),
            equals: equals.to_string(),
        });
        self
    }
}

/// Ordered list of sources; order decides which source names an entity first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceManifest {
    pub sources: Vec<SourceSpec>,
}

impl SourceManifest {
    pub fn new(sources: Vec<SourceSpec>) -> Self {
        Self { sources }
    }

    /// The bundled manifest for the reference deployment
    pub fn reference() -> Result<Self> {
        Self::from_toml_str(REFERENCE_MANIFEST)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let manifest: SourceManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read manifest '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Metric column names in manifest order
    pub fn metrics(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.metric.clone()).collect()
    }

    /// Check everything that would otherwise fail halfway through a run
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(PipelineError::Configuration("source manifest declares no sources".into()));
        }
        let mut ids = HashSet::new();
        let mut metrics = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(PipelineError::Configuration("source id must not be empty".into()));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(PipelineError::Configuration(format!("duplicate source id '{}'", source.id)));
            }
            if !is_sql_identifier(&source.metric) || is_reserved_column(&source.metric) {
                return Err(PipelineError::Configuration(format!(
                    "source '{}': metric name '{}' is not a usable column name",
                    source.id, source.metric
                )));
            }
            if !metrics.insert(source.metric.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "metric '{}' is declared by more than one source",
                    source.metric
                )));
            }
            if source.code_columns.is_empty() || source.name_columns.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "source '{}' needs at least one code and one name column candidate",
                    source.id
                )));
            }
            source.scale.validate().map_err(|e| prefix_source(&source.id, e))?;
            if let Some(clip) = &source.clip {
                clip.validate().map_err(|e| prefix_source(&source.id, e))?;
            }
            source.domain.validate().map_err(|e| prefix_source(&source.id, e))?;
        }
        Ok(())
    }
}

fn prefix_source(source_id: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Configuration(msg) => PipelineError::Configuration(format!("source '{source_id}': {msg}")),
        other => other,
    }
}
