//! Error taxonomy for the ingestion-to-notification pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch failed for {location}: {message}")]
    Fetch { location: String, message: String },

    #[error("observation at {timestamp} is missing {field}")]
    Validation {
        timestamp: String,
        field: &'static str,
    },

    #[error("no valid observations for {0}")]
    EmptyResult(String),

    #[error("cache error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("cache migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn fetch(location: impl Into<String>, message: impl ToString) -> Self {
        Error::Fetch {
            location: location.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
