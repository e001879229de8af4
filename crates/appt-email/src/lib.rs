//! appt-email: Inbound business mail
//!
//! Parses raw messages and files the appointments they describe into the
//! business store.

pub mod error;
pub mod ingest;
pub mod message;

pub use error::{EmailError, Result};
pub use ingest::{MailIngestor, MailOutcome};
pub use message::MailMessage;
