//! The calendar store capability

use std::sync::Arc;

use appt_core::{Appointment, AppointmentPatch, StoreBackend, StoreConfig, StoreKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::{CalDavStore, MemoryStore, SqliteStore};

/// Lookup by a tracking attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingQuery {
    /// Private records pointing at this mirror
    SyncedPeerId(String),
    /// Mirrors produced from this private record
    SourcePrivateId(String),
    /// Mirrors owned by this user
    SourceUserId(String),
}

/// Selection criteria for [`CalendarStore::find`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreQuery {
    /// Records whose start instant falls within `[start, end]`
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Records whose title starts with this prefix, case-insensitively
    TitlePrefix(String),
    Tracking(TrackingQuery),
}

impl StoreQuery {
    pub fn time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::TimeRange { start, end }
    }

    pub fn title_prefix(prefix: impl Into<String>) -> Self {
        Self::TitlePrefix(prefix.into())
    }

    pub fn source_private_id(id: impl Into<String>) -> Self {
        Self::Tracking(TrackingQuery::SourcePrivateId(id.into()))
    }

    pub fn synced_peer_id(id: impl Into<String>) -> Self {
        Self::Tracking(TrackingQuery::SyncedPeerId(id.into()))
    }

    pub fn source_user_id(id: impl Into<String>) -> Self {
        Self::Tracking(TrackingQuery::SourceUserId(id.into()))
    }

    /// Client-side evaluation, for adapters that cannot filter natively
    pub fn matches(&self, appointment: &Appointment) -> bool {
        match self {
            Self::TimeRange { start, end } => {
                let instant = appointment.start.with_timezone(&Utc);
                instant >= *start && instant <= *end
            }
            Self::TitlePrefix(prefix) => appointment
                .title
                .to_lowercase()
                .starts_with(&prefix.to_lowercase()),
            Self::Tracking(TrackingQuery::SyncedPeerId(id)) => {
                appointment.tracking.synced_peer_id.as_deref() == Some(id)
            }
            Self::Tracking(TrackingQuery::SourcePrivateId(id)) => {
                appointment.tracking.source_private_id.as_deref() == Some(id)
            }
            Self::Tracking(TrackingQuery::SourceUserId(id)) => {
                appointment.tracking.source_user_id.as_deref() == Some(id)
            }
        }
    }
}

/// Create/read/update/delete/query over one backing calendar
///
/// Implementations are pure I/O. `update` and `delete` report a missing
/// record as [`StoreError::NotFound`]; callers decide whether that matters.
#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// Store identity, used in logs
    fn name(&self) -> &str;

    fn kind(&self) -> StoreKind;

    /// Persist a new record and return its external identity.
    /// Any `id` already on `record` is ignored.
    async fn create(&self, record: &Appointment) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<Appointment>>;

    async fn update(&self, id: &str, patch: &AppointmentPatch) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Records matching `query`, ordered by creation time
    async fn find(&self, query: &StoreQuery) -> Result<Vec<Appointment>>;
}

/// Open the adapter described by `config`
pub fn open_store(
    config: &StoreConfig,
    name: &str,
    kind: StoreKind,
) -> Result<Arc<dyn CalendarStore>> {
    let store: Arc<dyn CalendarStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(name, kind)),
        StoreBackend::Sqlite => {
            let path = config.path.as_deref().ok_or_else(|| {
                StoreError::Configuration(format!("store '{}' needs a path", name))
            })?;
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Configuration(format!(
                            "cannot create directory for store '{}': {}",
                            name, e
                        ))
                    })?;
                }
            }
            Arc::new(SqliteStore::open(path, name, kind)?)
        }
        StoreBackend::Caldav => Arc::new(CalDavStore::new(config, name, kind)?),
    };
    Ok(store)
}

/// Order records by creation time, then identity, so the earliest is first
pub(crate) fn sort_by_creation(records: &mut [Appointment]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use appt_core::TrackingFields;
    use chrono::{FixedOffset, TimeZone};

    fn sample() -> Appointment {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut appt = Appointment::new(
            "Team Sync",
            tz.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 6, 2, 11, 0, 0).unwrap(),
        );
        appt.tracking = TrackingFields::mirror_of("alice", "p-7");
        appt
    }

    #[test]
    fn test_time_range_compares_instants() {
        let appt = sample();
        // 10:00 at +02:00 is 08:00 UTC
        let hit = StoreQuery::time_range(
            Utc.with_ymd_and_hms(2025, 6, 2, 7, 55, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 8, 5, 0).unwrap(),
        );
        let miss = StoreQuery::time_range(
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 55, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 5, 0).unwrap(),
        );
        assert!(hit.matches(&appt));
        assert!(!miss.matches(&appt));
    }

    #[test]
    fn test_title_prefix_is_case_insensitive() {
        let appt = sample();
        assert!(StoreQuery::title_prefix("team").matches(&appt));
        assert!(StoreQuery::title_prefix("TEAM S").matches(&appt));
        assert!(!StoreQuery::title_prefix("sync").matches(&appt));
    }

    #[test]
    fn test_tracking_queries() {
        let appt = sample();
        assert!(StoreQuery::source_private_id("p-7").matches(&appt));
        assert!(StoreQuery::source_user_id("alice").matches(&appt));
        assert!(!StoreQuery::source_private_id("p-8").matches(&appt));
        assert!(!StoreQuery::synced_peer_id("p-7").matches(&appt));
    }

    #[test]
    fn test_open_sqlite_requires_path() {
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            ..Default::default()
        };
        assert!(matches!(
            open_store(&config, "x", StoreKind::Shared),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_open_memory_store() {
        let store = open_store(&StoreConfig::memory(), "scratch", StoreKind::Business).unwrap();
        assert_eq!(store.name(), "scratch");
        assert_eq!(store.kind(), StoreKind::Business);
    }
}
