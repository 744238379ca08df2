//! Processed dataset file: the handoff between the normalize and load steps.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::domain::CountryMetricsTable;
use crate::error::{PipelineError, Result};
use crate::table::Table;

/// Replace the artifact at `path` with `table` in a single rename.
///
/// Readers see either the previous file or the new one, never a partial
/// write. Returns the sha256 of the written bytes.
pub fn write_atomic(table: &CountryMetricsTable, path: &Path) -> Result<String> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;

    let mut buf = Vec::new();
    table.to_table().write_csv(&mut buf)?;
    let fingerprint = hex::encode(Sha256::digest(&buf));

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(&buf)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;

    info!(
        path = %path.display(),
        rows = table.len(),
        bytes = buf.len(),
        fingerprint = %fingerprint,
        "Wrote processed dataset"
    );
    Ok(fingerprint)
}

/// Load a processed dataset written by `write_atomic`
pub fn read(path: &Path) -> Result<CountryMetricsTable> {
    if !path.is_file() {
        return Err(PipelineError::Configuration(format!(
            "processed dataset not found at {}; run normalize first",
            path.display()
        )));
    }
    let table = Table::from_csv_path(path)?;
    CountryMetricsTable::from_table(&path.display().to_string(), &table)
}
