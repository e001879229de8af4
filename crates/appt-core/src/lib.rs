//! appt-core: shared foundation for the appointment gateway
//!
//! Configuration, the generation (LLM) client, the shared error type and the
//! appointment data model used by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod llm;
pub mod models;

pub use config::{
    Config, DedupConfig, ExtractionConfig, LlmConfig, LlmProvider, StoreBackend, StoreConfig,
    SyncConfig, UserConfig, UserContext,
};
pub use error::{Error, Result};
pub use llm::{ClaudeClient, Message, MessageContent, TextGenerator};
pub use models::{Appointment, AppointmentPatch, StoreKind, SyncState, TrackingFields};
