use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Schema error in source '{source_id}' (column '{column}'): {message}")]
    Schema {
        source_id: String,
        column: String,
        message: String,
    },

    #[error("Validation error on field '{field}' (value {value}): {message}")]
    Validation {
        field: String,
        value: String,
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),
}

impl PipelineError {
    pub fn schema(source_id: &str, column: &str, message: impl Into<String>) -> Self {
        PipelineError::Schema {
            source_id: source_id.to_string(),
            column: column.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(field: &str, value: impl ToString, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        PipelineError::Storage {
            message: message.into(),
        }
    }

    /// Row-local errors exclude a single row; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Validation { .. })
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
