//! Pipeline error taxonomy shared by the offline stages and the updater.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing data: {}", path.display())]
    MissingData { path: PathBuf },
    #[error("missing required column '{column}' ({context})")]
    MissingColumn {
        column: String,
        context: &'static str,
    },
    #[error("column '{column}' must be numeric ({context})")]
    InvalidColumnType {
        column: String,
        context: &'static str,
    },
    #[error("cross-feed join produced zero rows (left={left_rows}, right={right_rows})")]
    EmptyJoin { left_rows: usize, right_rows: usize },
    #[error("feed '{feed}' has no valid observations")]
    NoValidObservations { feed: &'static str },
    #[error("zip archive {} has no CSV entry", path.display())]
    MissingCsvEntry { path: PathBuf },
    #[error("feature schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("feature schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn missing_column(column: impl Into<String>, context: &'static str) -> Self {
        Self::MissingColumn {
            column: column.into(),
            context,
        }
    }
}
