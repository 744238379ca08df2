use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::{MetricsStore, PersistedRecord, StoreError, StoreResult};
use crate::constants::{is_reserved_column, METRICS_TABLE, YEAR_FLOOR};
use crate::domain::CountryMetricsRow;
use crate::error::{PipelineError, Result};
use crate::pipeline::sources::is_sql_identifier;

/// Where a `DATABASE_URL` points
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

impl DatabaseLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(DatabaseLocation::Memory);
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .or_else(|| url.strip_prefix("file:"))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "unsupported DATABASE_URL '{url}'; expected sqlite://<path>, sqlite::memory: or file:<path>"
                ))
            })?;
        Ok(DatabaseLocation::File(PathBuf::from(path)))
    }
}

/// SQLite-backed store; one connection per process run
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(url: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = match DatabaseLocation::parse(url)? {
            DatabaseLocation::Memory => Connection::open_in_memory()?,
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&path)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                conn
            }
        };
        conn.busy_timeout(busy_timeout)?;
        info!(url, "Opened metrics store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Fatal("connection lock poisoned".into()))
    }
}

fn classify(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) | Some(ErrorCode::CannotOpen) => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn check_columns(metrics: &[String]) -> StoreResult<()> {
    match metrics.iter().find(|m| !is_sql_identifier(m) || is_reserved_column(m)) {
        Some(bad) => Err(StoreError::Fatal(format!("'{bad}' is not a usable metric column"))),
        None => Ok(()),
    }
}

fn table_columns(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({METRICS_TABLE})"))
        .map_err(classify)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(classify)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(classify)?;
    Ok(names)
}

fn metric_columns(conn: &Connection) -> StoreResult<Vec<String>> {
    Ok(table_columns(conn)?
        .into_iter()
        .filter(|c| !is_reserved_column(c))
        .collect())
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{raw}': {e}")))
}

/// `stored` is every metric column the table has; the ones missing from
/// `metrics` are reset to NULL on conflict so the newest dataset replaces the row.
fn upsert_sql(metrics: &[String], stored: &[String]) -> String {
    let mut columns = vec!["entity_code", "entity_name", "iso3", "year"];
    columns.extend(metrics.iter().map(String::as_str));
    columns.extend(["created_at", "updated_at"]);

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let mut updates: Vec<String> = vec!["entity_name=excluded.entity_name".into(), "iso3=excluded.iso3".into()];
    updates.extend(metrics.iter().map(|m| format!("\"{m}\"=excluded.\"{m}\"")));
    updates.extend(
        stored
            .iter()
            .filter(|c| !metrics.contains(c))
            .map(|c| format!("\"{c}\"=NULL")),
    );
    updates.push("updated_at=excluded.updated_at".into());

    format!(
        "INSERT INTO {METRICS_TABLE} ({}) VALUES ({}) ON CONFLICT(entity_code, year) DO UPDATE SET {}",
        columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

fn row_params(row: &CountryMetricsRow, now: &str) -> Vec<Value> {
    let mut values = vec![
        Value::Text(row.entity_code.clone()),
        Value::Text(row.entity_name.clone()),
        row.iso3().map(Value::Text).unwrap_or(Value::Null),
        Value::Integer(row.year as i64),
    ];
    values.extend(row.values.iter().map(|v| v.map(Value::Real).unwrap_or(Value::Null)));
    values.push(Value::Text(now.to_string()));
    values.push(Value::Text(now.to_string()));
    values
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn ensure_schema(&self, metrics: &[String]) -> StoreResult<()> {
        check_columns(metrics)?;
        let conn = self.conn()?;
        let metric_ddl: String = metrics.iter().map(|m| format!("    \"{m}\" REAL,\n")).collect();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {METRICS_TABLE} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_code TEXT NOT NULL CHECK (length(entity_code) > 0),
                entity_name TEXT NOT NULL,
                iso3        TEXT,
                year        INTEGER NOT NULL CHECK (year >= {YEAR_FLOOR}),
            {metric_ddl}
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                CONSTRAINT uq_country_year UNIQUE (entity_code, year)
            );
            "#
        ))
        .map_err(classify)?;

        let existing = table_columns(&conn)?;
        for metric in metrics.iter().filter(|m| !existing.contains(m)) {
            conn.execute_batch(&format!("ALTER TABLE {METRICS_TABLE} ADD COLUMN \"{metric}\" REAL;"))
                .map_err(classify)?;
            info!(column = %metric, "Added metric column");
        }
        Ok(())
    }

    async fn upsert_batch(&self, metrics: &[String], rows: &[CountryMetricsRow]) -> StoreResult<usize> {
        check_columns(metrics)?;
        let mut conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().map_err(classify)?;
        {
            let stored = metric_columns(&tx)?;
            let mut stmt = tx.prepare(&upsert_sql(metrics, &stored)).map_err(classify)?;
            for row in rows {
                stmt.execute(params_from_iter(row_params(row, &now))).map_err(|e| {
                    match e.sqlite_error_code() {
                        Some(ErrorCode::ConstraintViolation) => StoreError::Rejected {
                            entity_code: row.entity_code.clone(),
                            year: row.year,
                            message: e.to_string(),
                        },
                        _ => classify(e),
                    }
                })?;
            }
        }
        tx.commit().map_err(classify)?;
        debug!(rows = rows.len(), "Committed upsert batch");
        Ok(rows.len())
    }

    async fn fetch(&self, entity_code: &str, year: i32) -> StoreResult<Option<PersistedRecord>> {
        let conn = self.conn()?;
        let columns = table_columns(&conn)?;
        if columns.is_empty() {
            return Ok(None);
        }
        let metrics: Vec<String> = columns.into_iter().filter(|c| !is_reserved_column(c)).collect();
        let select_metrics: String = metrics.iter().map(|m| format!(", \"{m}\"")).collect();
        let sql = format!(
            "SELECT entity_code, entity_name, iso3, year, created_at, updated_at{select_metrics}
             FROM {METRICS_TABLE} WHERE entity_code = ?1 AND year = ?2"
        );
        let raw = conn
            .query_row(&sql, params![entity_code, year], |row| {
                let mut values = BTreeMap::new();
                for (i, metric) in metrics.iter().enumerate() {
                    values.insert(metric.clone(), row.get::<_, Option<f64>>(6 + i)?);
                }
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    values,
                ))
            })
            .optional()
            .map_err(classify)?;

        match raw {
            None => Ok(None),
            Some((entity_code, entity_name, iso3, year, created_at, updated_at, metrics)) => Ok(Some(PersistedRecord {
                entity_code,
                entity_name,
                iso3,
                year,
                metrics,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            })),
        }
    }

    async fn count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        if table_columns(&conn)?.is_empty() {
            return Ok(0);
        }
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {METRICS_TABLE}"), [], |row| row.get(0))
            .map_err(classify)?;
        Ok(n as usize)
    }

    async fn existing_keys(&self) -> StoreResult<BTreeSet<(String, i32)>> {
        let conn = self.conn()?;
        if table_columns(&conn)?.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut stmt = conn
            .prepare(&format!("SELECT entity_code, year FROM {METRICS_TABLE}"))
            .map_err(classify)?;
        let keys = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)))
            .map_err(classify)?
            .collect::<rusqlite::Result<BTreeSet<_>>>()
            .map_err(classify)?;
        Ok(keys)
    }
}
