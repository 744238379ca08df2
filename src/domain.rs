//! Domain data shapes shared by the normalize and load steps.

use crate::constants::{ENTITY_CODE_COL, ENTITY_NAME_COL, IDENTIFIER_COLUMNS, YEAR_COL};
use crate::error::{PipelineError, Result};
use crate::table::{Cell, Table};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ANNUAL_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})$").unwrap());
static MONTHLY_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap());
static QUARTERLY_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-Q(\d)$").unwrap());
static PERIOD_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}").unwrap());

/// Sampling frequency of a source series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Annual,
    Monthly,
    Quarterly,
}

/// A time period parsed from a wide-table column header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Year(i32),
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
}

impl Period {
    pub fn year(&self) -> i32 {
        match self {
            Period::Year(y) => *y,
            Period::Month { year, .. } => *year,
            Period::Quarter { year, .. } => *year,
        }
    }

    /// Parse a column header under the source's convention.
    ///
    /// Headers that do not start with four digits are metadata columns and
    /// yield `Ok(None)`. A header that starts like a period but does not fit
    /// the convention is a schema error naming the column.
    pub fn parse(source_id: &str, header: &str, frequency: Frequency) -> Result<Option<Period>> {
        let header = header.trim();
        if !PERIOD_LIKE.is_match(header) {
            return Ok(None);
        }

        let malformed = |why: &str| PipelineError::schema(source_id, header, why.to_string());

        match frequency {
            Frequency::Annual => {
                let caps = ANNUAL_HEADER
                    .captures(header)
                    .ok_or_else(|| malformed("expected a YYYY period header"))?;
                Ok(Some(Period::Year(parse_year(&caps[1]))))
            }
            Frequency::Monthly => {
                let caps = MONTHLY_HEADER
                    .captures(header)
                    .ok_or_else(|| malformed("expected a YYYY-MM period header"))?;
                let month: u32 = caps[2].parse().map_err(|_| malformed("month is not a number"))?;
                if !(1..=12).contains(&month) {
                    return Err(malformed("month out of range 1-12"));
                }
                Ok(Some(Period::Month {
                    year: parse_year(&caps[1]),
                    month,
                }))
            }
            Frequency::Quarterly => {
                let caps = QUARTERLY_HEADER
                    .captures(header)
                    .ok_or_else(|| malformed("expected a YYYY-Qn period header"))?;
                let quarter: u32 = caps[2].parse().map_err(|_| malformed("quarter is not a number"))?;
                if !(1..=4).contains(&quarter) {
                    return Err(malformed("quarter out of range 1-4"));
                }
                Ok(Some(Period::Quarter {
                    year: parse_year(&caps[1]),
                    quarter,
                }))
            }
        }
    }
}

// Four ASCII digits always fit in an i32
fn parse_year(digits: &str) -> i32 {
    digits.parse().unwrap_or_default()
}

/// One (entity, year, metric) value after reshaping.
/// `value` is `None` when the source had nothing for that key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualObservation {
    pub entity_code: String,
    pub entity_name: String,
    pub year: i32,
    pub metric: String,
    pub value: Option<f64>,
}

/// One wide row per (entity_code, year); `values` aligns with the owning table's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryMetricsRow {
    pub entity_code: String,
    pub entity_name: String,
    pub year: i32,
    pub values: Vec<Option<f64>>,
}

impl CountryMetricsRow {
    pub fn has_any_metric(&self) -> bool {
        self.values.iter().any(Option::is_some)
    }

    /// ISO 3166 alpha-3 code when the entity code has that shape
    pub fn iso3(&self) -> Option<String> {
        let code = self.entity_code.as_str();
        (code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())).then(|| code.to_ascii_uppercase())
    }
}

/// The processed dataset: identifier columns followed by one column per metric
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CountryMetricsTable {
    pub metrics: Vec<String>,
    pub rows: Vec<CountryMetricsRow>,
}

impl CountryMetricsTable {
    pub fn new(metrics: Vec<String>) -> Self {
        Self {
            metrics,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn metric_index(&self, metric: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m == metric)
    }

    /// Value of `metric` for the row keyed by (code, year)
    pub fn value(&self, entity_code: &str, year: i32, metric: &str) -> Option<f64> {
        let idx = self.metric_index(metric)?;
        self.rows
            .iter()
            .find(|r| r.entity_code == entity_code && r.year == year)
            .and_then(|r| r.values[idx])
    }

    pub fn row(&self, entity_code: &str, year: i32) -> Option<&CountryMetricsRow> {
        self.rows.iter().find(|r| r.entity_code == entity_code && r.year == year)
    }

    pub fn to_table(&self) -> Table {
        let mut columns: Vec<String> = IDENTIFIER_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(self.metrics.iter().cloned());
        let mut table = Table::new(columns);
        for row in &self.rows {
            let mut cells = vec![
                Cell::Text(row.entity_code.clone()),
                Cell::Text(row.entity_name.clone()),
                Cell::Integer(row.year as i64),
            ];
            cells.extend(row.values.iter().map(|v| Cell::from_f64(*v)));
            // widths always agree: identifiers + one cell per metric
            let _ = table.push_row(cells);
        }
        table
    }

    /// Rebuild from a table whose header starts with the identifier columns
    pub fn from_table(source_id: &str, table: &Table) -> Result<Self> {
        for required in IDENTIFIER_COLUMNS {
            if table.column_index(required).is_none() {
                return Err(PipelineError::schema(source_id, required, "required column is missing"));
            }
        }
        let code_idx = table.column_index(ENTITY_CODE_COL).unwrap_or_default();
        let name_idx = table.column_index(ENTITY_NAME_COL).unwrap_or_default();
        let year_idx = table.column_index(YEAR_COL).unwrap_or_default();

        let metric_cols: Vec<(usize, String)> = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| !IDENTIFIER_COLUMNS.contains(&c.as_str()))
            .map(|(i, c)| (i, c.clone()))
            .collect();

        let mut out = CountryMetricsTable::new(metric_cols.iter().map(|(_, c)| c.clone()).collect());
        for (line, cells) in table.rows().enumerate() {
            let entity_code = cells[code_idx]
                .as_str()
                .ok_or_else(|| PipelineError::schema(source_id, ENTITY_CODE_COL, format!("empty code on row {}", line + 1)))?
                .to_string();
            let year = cells[year_idx]
                .as_i64()
                .and_then(|y| i32::try_from(y).ok())
                .ok_or_else(|| {
                    PipelineError::schema(
                        source_id,
                        YEAR_COL,
                        format!("year '{}' on row {} is not a valid integer year", cells[year_idx].render(), line + 1),
                    )
                })?;
            let values = metric_cols
                .iter()
                .map(|(i, column)| match &cells[*i] {
                    Cell::Missing => Ok(None),
                    cell => cell.as_f64().map(Some).ok_or_else(|| {
                        PipelineError::schema(source_id, column, format!("non-numeric value '{}' on row {}", cell.render(), line + 1))
                    }),
                })
                .collect::<Result<Vec<_>>>()?;
            out.rows.push(CountryMetricsRow {
                entity_code,
                entity_name: cells[name_idx].render(),
                year,
                values,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_headers() {
        assert_eq!(Period::parse("s", "2020", Frequency::Annual).unwrap(), Some(Period::Year(2020)));
        assert_eq!(
            Period::parse("s", "2020-03", Frequency::Monthly).unwrap(),
            Some(Period::Month { year: 2020, month: 3 })
        );
        assert_eq!(
            Period::parse("s", "2019-Q4", Frequency::Quarterly).unwrap(),
            Some(Period::Quarter { year: 2019, quarter: 4 })
        );
        assert_eq!(Period::parse("s", "REF_AREA", Frequency::Annual).unwrap(), None);
    }

    #[test]
    fn test_malformed_period_headers_are_schema_errors() {
        for (header, freq) in [
            ("2020-13", Frequency::Monthly),
            ("2020-Q5", Frequency::Quarterly),
            ("2020-01", Frequency::Annual),
            ("20201", Frequency::Annual),
        ] {
            match Period::parse("src", header, freq) {
                Err(PipelineError::Schema { column, .. }) => assert_eq!(column, header),
                other => panic!("expected schema error for {header}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_iso3_only_for_alpha3_codes() {
        let mut row = CountryMetricsRow {
            entity_code: "FRA".into(),
            entity_name: "France".into(),
            year: 2020,
            values: vec![],
        };
        assert_eq!(row.iso3().as_deref(), Some("FRA"));
        row.entity_code = "FR".into();
        assert_eq!(row.iso3(), None);
    }

    #[test]
    fn test_table_round_trip_preserves_absence() {
        let table = CountryMetricsTable {
            metrics: vec!["a".into(), "b".into()],
            rows: vec![CountryMetricsRow {
                entity_code: "FR".into(),
                entity_name: "France".into(),
                year: 2020,
                values: vec![Some(82.1), None],
            }],
        };
        let back = CountryMetricsTable::from_table("t", &table.to_table()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_from_table_requires_identifiers() {
        let table = Table::new(vec!["entity_code".into(), "year".into()]);
        let err = CountryMetricsTable::from_table("processed", &table).unwrap_err();
        assert!(err.to_string().contains("entity_name"));
    }

    #[test]
    fn test_from_table_rejects_out_of_range_year() {
        let mut table = Table::new(vec!["entity_code".into(), "entity_name".into(), "year".into()]);
        table
            .push_row(vec![Cell::from_raw("FR"), Cell::from_raw("France"), Cell::from_raw("4294969316")])
            .unwrap();
        let err = CountryMetricsTable::from_table("processed", &table).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { ref column, .. } if column == "year"));
    }
}
