//! Error types for appt-calendar

use thiserror::Error;

/// appt-calendar error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Transient I/O failure; the caller may retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backing store lacks a field this system needs. Not retryable.
    #[error("Store schema is missing required field '{field}'")]
    SchemaMissing { field: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Marshalling error: {0}")]
    Marshalling(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("CalDAV error: {0}")]
    Caldav(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
