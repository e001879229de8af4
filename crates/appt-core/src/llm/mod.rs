//! Generation backend client and types
//!
//! Supports both Claude API and OpenAI-compatible APIs. Engines depend only on
//! the [`TextGenerator`] capability, never on the wire format.

mod client;
mod types;

pub use client::{ClaudeClient, TextGenerator};
pub use types::*;
