use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid member token '{token}': {message}")]
    InvalidToken { token: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Stale cache entry: {0}")]
    StaleCache(String),

    #[error("Invalid parameter: {name} = {value}, {message}")]
    InvalidParameter {
        name: String,
        value: String,
        message: String,
    },
}

/// Type alias for Result with EnsembleError
pub type Result<T> = std::result::Result<T, EnsembleError>;

impl EnsembleError {
    /// Create a new InvalidToken error
    pub fn invalid_token(token: impl Into<String>, message: impl Into<String>) -> Self {
        EnsembleError::InvalidToken {
            token: token.into(),
            message: message.into(),
        }
    }

    /// Create a new NotFound error
    pub fn not_found(what: impl Into<String>) -> Self {
        EnsembleError::NotFound(what.into())
    }

    /// Create a new InvalidParameter error
    pub fn invalid_parameter(
        name: impl Into<String>,
        value: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        EnsembleError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    /// True for the "nothing to aggregate" condition, which usually points at
    /// a misconfigured base directory or prefix.
    pub fn is_no_data(&self) -> bool {
        matches!(self, EnsembleError::NoData(_))
    }
}
