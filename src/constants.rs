/// Column and path constants shared by the normalize and load steps.
/// The processed dataset header is a contract with downstream consumers,
/// so these names must not drift.

// Periods strictly before this year are discarded before merge
pub const YEAR_FLOOR: i32 = 2015;
pub const YEAR_CEILING: i32 = 2100;

// Identifier columns of the processed dataset
pub const ENTITY_CODE_COL: &str = "entity_code";
pub const ENTITY_NAME_COL: &str = "entity_name";
pub const YEAR_COL: &str = "year";

pub const IDENTIFIER_COLUMNS: [&str; 3] = [ENTITY_CODE_COL, ENTITY_NAME_COL, YEAR_COL];

// Store-only columns a metric may not shadow
pub const AUDIT_COLUMNS: [&str; 4] = ["id", "iso3", "created_at", "updated_at"];

// Entity column candidates in raw source files, tried in order
pub const DEFAULT_CODE_COLUMNS: [&str; 2] = ["REF_AREA", "REF_AREA_ID"];
pub const DEFAULT_NAME_COLUMNS: [&str; 2] = ["REF_AREA_LABEL", "REF_AREA_NAME"];

// Cell contents that mean "no value"
pub const MISSING_TOKENS: [&str; 6] = ["", "..", "NA", "NaN", "nan", "null"];

pub const ENTITY_NAME_MAX_LEN: usize = 120;

// Default locations and knobs
pub const DEFAULT_RAW_DIR: &str = "data/raw";
pub const DEFAULT_OUTPUT_PATH: &str = "data/processed/country_metrics.csv";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 200;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

pub const METRICS_TABLE: &str = "country_metrics";

pub fn is_reserved_column(name: &str) -> bool {
    IDENTIFIER_COLUMNS.contains(&name) || AUDIT_COLUMNS.contains(&name)
}

/// Whether a cell should be read as absent
pub fn is_missing_token(raw: &str) -> bool {
    let trimmed = raw.trim();
    MISSING_TOKENS.iter().any(|t| *t == trimmed)
}
