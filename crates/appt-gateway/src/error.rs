//! Error types for appt-gateway

use appt_calendar::StoreError;
use appt_extract::{ExtractionError, ValidationError};
use appt_sync::SyncError;
use thiserror::Error;

/// Everything an orchestrated operation can report back to the front end
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Core error: {0}")]
    Core(#[from] appt_core::Error),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Invalid appointment: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Appointment not found: {0}")]
    NotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
