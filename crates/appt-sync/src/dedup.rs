//! Duplicate detection against a target store
//!
//! Lookups always read the store; there is no local cache.

use appt_calendar::{CalendarStore, StoreError, StoreQuery};
use appt_core::{Appointment, DedupConfig};
use chrono::{Duration, Utc};
use tracing::debug;

/// Finds records that already represent a candidate
#[derive(Debug, Clone)]
pub struct Deduplicator {
    tolerance: Duration,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

impl Deduplicator {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.tolerance())
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Whether `store` already holds a record matching `candidate`
    pub async fn is_duplicate(
        &self,
        store: &dyn CalendarStore,
        candidate: &Appointment,
    ) -> Result<bool, StoreError> {
        Ok(self.find_duplicate(store, candidate).await?.is_some())
    }

    /// The canonical match for `candidate`: among records starting within the
    /// tolerance whose normalized titles are equal, the earliest created
    pub async fn find_duplicate(
        &self,
        store: &dyn CalendarStore,
        candidate: &Appointment,
    ) -> Result<Option<Appointment>, StoreError> {
        let start = candidate.start.with_timezone(&Utc);
        let query = StoreQuery::time_range(start - self.tolerance, start + self.tolerance);
        let title = normalize_title(&candidate.title);

        let canonical = store
            .find(&query)
            .await?
            .into_iter()
            .filter(|r| normalize_title(&r.title) == title)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        if let Some(ref existing) = canonical {
            debug!(
                store = %store.name(),
                existing = ?existing.id,
                title = %candidate.title,
                "Duplicate found"
            );
        }
        Ok(canonical)
    }
}

/// Trimmed, whitespace-collapsed, lowercased title
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
