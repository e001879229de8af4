//! appt-sync: Mirroring partner-relevant appointments into the shared calendar
//!
//! ## Flow
//!
//! 1. [`plan`] compares a record before and after an edit and decides which
//!    [`SyncOperation`] (if any) the edit needs.
//! 2. [`SyncDispatcher::submit`] queues the task; tasks for one record run in
//!    order, different records run concurrently.
//! 3. [`SyncEngine::run`] executes the task idempotently with bounded
//!    retries, linking the private record and its mirror through their
//!    tracking fields.
//!
//! Failures never roll back the private record. Its sync-state marker
//! records what happened, and terminal failures are published as
//! [`SyncReport`]s.
//!
//! ```rust,ignore
//! let engine = Arc::new(SyncEngine::new(shared).with_user("alice", private));
//! let (dispatcher, mut reports) = SyncDispatcher::new(engine, 4);
//!
//! if let Some(op) = plan(None, Some(&record)) {
//!     dispatcher.submit(SyncTask::new(record_id, "alice", op));
//! }
//! ```

pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod retry;
pub mod state;
pub mod task;

pub use dedup::{normalize_title, Deduplicator};
pub use dispatcher::{wait_all, SyncDispatcher, SyncReport, SyncTicket};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use retry::RetryPolicy;
pub use state::{plan, plan_resync};
pub use task::{SyncOperation, SyncOutcome, SyncTask};
