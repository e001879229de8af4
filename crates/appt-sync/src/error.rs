//! Error types for appt-sync

use appt_calendar::StoreError;
use thiserror::Error;

/// Sync engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A matching shared record exists that the engine does not own.
    /// Non-fatal: logged, and no mirror is written.
    #[error("Record {record_id} duplicates existing shared record {existing_id}")]
    DuplicateDetected {
        record_id: String,
        existing_id: String,
    },

    /// Transient store failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store lacks a required field. Fatal, never retried.
    #[error("Store '{store}' is missing required field '{field}'")]
    SchemaMissing { store: String, field: String },

    /// Terminal failure: bounded retries ran out, or the failure could not
    /// be helped by retrying (`attempts` is then 1)
    #[error("Sync of {record_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        record_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Internal to a run; reported as `RetriesExhausted`
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The task names a user with no registered store; rejected before it runs
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Non-retryable store failure other than a missing field. Internal to a
    /// run; reported as `RetriesExhausted`.
    #[error("Store error: {0}")]
    Store(String),

    /// Removed from the queue before it started
    #[error("Sync task cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub(crate) fn from_store(store: &str, error: StoreError) -> Self {
        match error {
            e if e.is_retryable() => Self::StoreUnavailable(format!("{}: {}", store, e)),
            StoreError::SchemaMissing { field } => Self::SchemaMissing {
                store: store.to_string(),
                field,
            },
            StoreError::NotFound(id) => Self::RecordNotFound(id),
            other => Self::Store(format!("{}: {}", store, other)),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SyncError>;
