//! appt-calendar: Calendar store adapters
//!
//! Every backing calendar (a user's private store, the shared store, the
//! business store) is consumed through the [`CalendarStore`] capability.
//! Adapters alone know how tracking fields are represented natively.
//!
//! ## Adapters
//!
//! - [`MemoryStore`]: process-local, for development and tests
//! - [`SqliteStore`]: rows with a JSON attribute bag for tracking fields
//! - [`CalDavStore`]: iCalendar over HTTP, tracking fields as `X-APPT-*` properties
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appt_calendar::{CalendarStore, MemoryStore, StoreQuery};
//! use appt_core::StoreKind;
//!
//! let store = MemoryStore::new("shared", StoreKind::Shared);
//! let id = store.create(&appointment).await?;
//! let mirrors = store
//!     .find(&StoreQuery::source_private_id("p-1"))
//!     .await?;
//! ```

pub mod caldav;
pub mod error;
pub mod ical;
pub mod memory;
pub mod sqlite;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use caldav::CalDavStore;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{open_store, CalendarStore, StoreQuery, TrackingQuery};
