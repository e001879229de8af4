//! Error types for appt-core

use thiserror::Error;

/// Main error type for appt-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("LLM API error: {0}")]
    Llm(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM request timed out")]
    Timeout,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown user: {0}")]
    UnknownUser(String),
}

/// Result type alias for appt-core
pub type Result<T> = std::result::Result<T, Error>;
