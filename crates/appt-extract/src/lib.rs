//! appt-extract: Free text to appointments
//!
//! ## Pipeline
//!
//! 1. [`Extractor::extract`] asks a [`appt_core::TextGenerator`] for one
//!    structured object, parses the reply defensively and resolves
//!    relative dates against the caller's reference instant.
//! 2. [`normalize`] turns the candidate into an [`appt_core::Appointment`]
//!    with offset-carrying instants, or a typed [`ValidationError`].
//!
//! ```rust,ignore
//! let result = extractor.extract("Dentist tomorrow 9am", Utc::now(), tz).await?;
//! let appointment = normalize(&result.candidate, tz)?;
//! ```

pub mod error;
pub mod extractor;
pub mod normalize;
pub mod parse;
pub mod prompt;
pub mod relative;
pub mod types;

pub use error::{ExtractionError, Result, ValidationError};
pub use extractor::Extractor;
pub use normalize::{collapse_whitespace, normalize};
pub use parse::{locate_object, parse_reply};
pub use types::{AppointmentCandidate, ExtractionResult, DEFAULT_DURATION_MINUTES};
