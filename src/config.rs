use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_RETRIES, DEFAULT_OUTPUT_PATH, DEFAULT_RAW_DIR,
    DEFAULT_RETRY_BASE_MS,
};
use crate::error::{PipelineError, Result};
use crate::pipeline::sources::SourceManifest;

/// Credentials for the retired city collectors. Read so that a configured
/// environment does not error, but nothing in the country pipeline uses them.
#[derive(Debug, Clone, Default)]
pub struct LegacyApiCredentials {
    pub openweather_api_key: Option<String>,
    pub geodb_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub raw_dir: PathBuf,
    pub output_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub busy_timeout: Duration,
    pub legacy: LegacyApiCredentials,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            raw_dir: PathBuf::from(DEFAULT_RAW_DIR),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            manifest_path: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            legacy: LegacyApiCredentials::default(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment, loading `.env` first if present
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup; `from_env` passes the real environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let batch_size: usize = parse_knob("COUNTRY_METRICS_BATCH_SIZE", get("COUNTRY_METRICS_BATCH_SIZE"), defaults.batch_size)?;
        if batch_size == 0 {
            return Err(PipelineError::Configuration("COUNTRY_METRICS_BATCH_SIZE must be at least 1".into()));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            raw_dir: get("COUNTRY_METRICS_RAW_DIR").map(PathBuf::from).unwrap_or(defaults.raw_dir),
            output_path: get("COUNTRY_METRICS_OUTPUT").map(PathBuf::from).unwrap_or(defaults.output_path),
            manifest_path: get("COUNTRY_METRICS_MANIFEST").map(PathBuf::from),
            batch_size,
            max_retries: parse_knob("COUNTRY_METRICS_MAX_RETRIES", get("COUNTRY_METRICS_MAX_RETRIES"), defaults.max_retries)?,
            retry_base: Duration::from_millis(parse_knob(
                "COUNTRY_METRICS_RETRY_BASE_MS",
                get("COUNTRY_METRICS_RETRY_BASE_MS"),
                DEFAULT_RETRY_BASE_MS,
            )?),
            busy_timeout: Duration::from_millis(parse_knob(
                "COUNTRY_METRICS_BUSY_TIMEOUT_MS",
                get("COUNTRY_METRICS_BUSY_TIMEOUT_MS"),
                DEFAULT_BUSY_TIMEOUT_MS,
            )?),
            legacy: LegacyApiCredentials {
                openweather_api_key: get("OPENWEATHER_API_KEY"),
                geodb_api_key: get("GEODB_API_KEY"),
            },
        })
    }

    /// Connection string for the store; required by the load step only
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("DATABASE_URL environment variable is not set".into()))
    }

    /// The configured manifest file, or the bundled reference manifest
    pub fn load_manifest(&self) -> Result<SourceManifest> {
        match &self.manifest_path {
            Some(path) => SourceManifest::from_path(path),
            None => SourceManifest::reference(),
        }
    }
}

fn parse_knob<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| PipelineError::Configuration(format!("{key} has invalid value '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.raw_dir, PathBuf::from("data/raw"));
        assert_eq!(settings.batch_size, 500);
        assert!(settings.database_url().is_err());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite://metrics.db"),
            ("COUNTRY_METRICS_BATCH_SIZE", "50"),
            ("COUNTRY_METRICS_RETRY_BASE_MS", "10"),
            ("OPENWEATHER_API_KEY", "abc"),
        ]))
        .unwrap();
        assert_eq!(settings.database_url().unwrap(), "sqlite://metrics.db");
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.retry_base, Duration::from_millis(10));
        assert_eq!(settings.legacy.openweather_api_key.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_knob_is_configuration_error() {
        let err = Settings::from_lookup(lookup(&[("COUNTRY_METRICS_MAX_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(Settings::from_lookup(lookup(&[("COUNTRY_METRICS_BATCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_bundled_manifest_when_unset() {
        let settings = Settings::default();
        assert_eq!(settings.load_manifest().unwrap().sources.len(), 13);
    }
}
