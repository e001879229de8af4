//! Error types for appt-email

use appt_calendar::StoreError;
use appt_extract::{ExtractionError, ValidationError};
use thiserror::Error;

/// appt-email error type
#[derive(Error, Debug)]
pub enum EmailError {
    #[error("Email parsing error: {0}")]
    Parsing(String),

    #[error("Message has no readable text body")]
    NoBody,

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Invalid appointment: {0}")]
    Validation(#[from] ValidationError),

    #[error("Business store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EmailError>;
