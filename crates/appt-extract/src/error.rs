//! Error types for appt-extract

use std::time::Duration;

use thiserror::Error;

use crate::types::ExtractionResult;

/// Failure to turn free text into a candidate appointment
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// The generation backend replied without a usable structured object
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The generation call did not finish in time. Not retried here.
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    /// A candidate was produced but needs clarification before it is created
    #[error("Extraction confidence {confidence:.2} is below the floor")]
    LowConfidence {
        confidence: f32,
        result: Box<ExtractionResult>,
    },

    #[error("Generation backend error: {0}")]
    Generation(String),
}

/// A candidate that cannot become an appointment as is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid range: end {end} is not after start {start}")]
    InvalidRange { start: String, end: String },

    /// Local time skipped by a daylight-saving transition
    #[error("Local time {local} does not exist in {timezone}")]
    NonexistentLocalTime { local: String, timezone: String },
}

impl ExtractionError {
    /// The partial result carried by a low-confidence outcome
    pub fn partial_result(&self) -> Option<&ExtractionResult> {
        match self {
            Self::LowConfidence { result, .. } => Some(result),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractionError>;
