//! Lightweight in-memory relational table.
//!
//! Raw source files and the processed dataset both pass through [`Table`]:
//! ordered named columns, typed cells, and a missing sentinel that is
//! distinct from zero. Transformations return new tables instead of
//! mutating their input.

use crate::constants::is_missing_token;
use crate::error::{PipelineError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Read, Write};
use std::path::Path;

static THOUSANDS_GROUPED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d{1,3}(,\d{3})+(\.\d+)?$").unwrap());

/// Parse numeric text. Commas are only accepted as strict thousands grouping,
/// so a decimal comma like `1,5` is unparseable rather than read as 15.
fn parse_number(text: &str) -> Option<f64> {
    let parsed = if THOUSANDS_GROUPED.is_match(text) {
        text.replace(',', "").parse::<f64>()
    } else {
        text.parse::<f64>()
    };
    parsed.ok().filter(|v| v.is_finite())
}

/// A single typed value in a [`Table`]
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Cell {
    /// Build a cell from raw CSV text, keeping it as text unless it is a missing token
    pub fn from_raw(raw: &str) -> Cell {
        if is_missing_token(raw) {
            Cell::Missing
        } else {
            Cell::Text(raw.trim().to_string())
        }
    }

    /// Build a cell from an optional number; non-finite values become missing
    pub fn from_f64(value: Option<f64>) -> Cell {
        match value {
            Some(v) if v.is_finite() => Cell::Number(v),
            _ => Cell::Missing,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view of the cell. Text is parsed; unparseable or non-finite text yields `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            Cell::Integer(v) => Some(*v as f64),
            Cell::Text(s) => parse_number(s.trim()),
            Cell::Missing => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(v) => Some(*v),
            Cell::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            Cell::Text(s) => s.parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Text written to CSV; missing renders as an empty field
    pub fn render(&self) -> String {
        match self {
            Cell::Missing => String::new(),
            Cell::Integer(v) => v.to_string(),
            Cell::Number(v) => v.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// First column from `candidates` that exists in this table
    pub fn find_column(&self, candidates: &[String]) -> Option<usize> {
        candidates.iter().find_map(|c| self.column_index(c))
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Configuration(format!(
                "row has {} cells but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell at `row` in the named column
    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// New table holding only rows for which `keep` returns true
    pub fn filter<F>(&self, mut keep: F) -> Table
    where
        F: FnMut(&[Cell]) -> bool,
    {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Read a CSV with a header row. Short rows are padded with missing cells.
    pub fn from_reader<R: Read>(reader: R) -> Result<Table> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let columns: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let width = columns.len();
        let mut table = Table::new(columns);
        for record in rdr.records() {
            let record = record?;
            let mut row: Vec<Cell> = record.iter().take(width).map(Cell::from_raw).collect();
            row.resize(width, Cell::Missing);
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Table> {
        let file = std::fs::File::open(path.as_ref())?;
        Table::from_reader(file)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(Cell::render))?;
        }
        wtr.flush()?;
        Ok(())
    }
}
