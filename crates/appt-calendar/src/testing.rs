//! Fault injection for exercising retry paths

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use appt_core::{Appointment, AppointmentPatch, StoreKind};
use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::store::{CalendarStore, StoreQuery};

/// Store operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Get,
    Update,
    Delete,
    Find,
}

/// Wraps a store and fails selected operations with [`StoreError::Unavailable`]
pub struct FlakyStore {
    inner: Arc<dyn CalendarStore>,
    failures: Mutex<HashMap<StoreOp, usize>>,
    schema_missing: Mutex<Option<String>>,
    /// `Some(retryable)` while patches that set a peer identity fail
    link_back: Mutex<Option<bool>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
    injected: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn CalendarStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            schema_missing: Mutex::new(None),
            link_back: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            injected: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures.entry(op).or_insert(0) += times;
        }
    }

    /// Fail every write as if the store lacked `field`
    pub fn fail_schema(&self, field: impl Into<String>) {
        if let Ok(mut missing) = self.schema_missing.lock() {
            *missing = Some(field.into());
        }
    }

    /// Fail every update that links a peer identity, leaving other updates
    /// alone. Retryable faults are [`StoreError::Unavailable`], the others
    /// [`StoreError::Marshalling`].
    pub fn fail_link_back(&self, retryable: bool) {
        if let Ok(mut link_back) = self.link_back.lock() {
            *link_back = Some(retryable);
        }
    }

    /// Drop every pending fault
    pub fn heal(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
        if let Ok(mut missing) = self.schema_missing.lock() {
            *missing = None;
        }
        if let Ok(mut link_back) = self.link_back.lock() {
            *link_back = None;
        }
    }

    /// Calls seen for `op`, including failed ones
    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Failures injected so far
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn CalendarStore> {
        &self.inner
    }

    fn enter(&self, op: StoreOp) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }

        if matches!(op, StoreOp::Create | StoreOp::Update) {
            if let Some(field) = self.schema_missing.lock().ok().and_then(|m| m.clone()) {
                return Err(StoreError::SchemaMissing { field });
            }
        }

        let mut failures = self
            .failures
            .lock()
            .map_err(|_| StoreError::Unavailable("fault table poisoned".to_string()))?;
        match failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                self.injected.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable(format!(
                    "injected {:?} failure on {}",
                    op,
                    self.inner.name()
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CalendarStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    async fn create(&self, record: &Appointment) -> Result<String> {
        self.enter(StoreOp::Create)?;
        self.inner.create(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        self.enter(StoreOp::Get)?;
        self.inner.get(id).await
    }

    async fn update(&self, id: &str, patch: &AppointmentPatch) -> Result<()> {
        self.enter(StoreOp::Update)?;
        if matches!(patch.synced_peer_id, Some(Some(_))) {
            if let Some(retryable) = self.link_back.lock().ok().and_then(|l| *l) {
                self.injected.fetch_add(1, Ordering::SeqCst);
                let reason = format!("injected link-back failure on {}", self.inner.name());
                return Err(if retryable {
                    StoreError::Unavailable(reason)
                } else {
                    StoreError::Marshalling(reason)
                });
            }
        }
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.enter(StoreOp::Delete)?;
        self.inner.delete(id).await
    }

    async fn find(&self, query: &StoreQuery) -> Result<Vec<Appointment>> {
        self.enter(StoreOp::Find)?;
        self.inner.find(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::{FixedOffset, TimeZone};

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let store = FlakyStore::new(Arc::new(MemoryStore::new("shared", StoreKind::Shared)));
        store.fail_next(StoreOp::Create, 2);

        let tz = FixedOffset::east_opt(0).unwrap();
        let appt = Appointment::new(
            "Flaky",
            tz.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
        );

        assert!(store.create(&appt).await.unwrap_err().is_retryable());
        assert!(store.create(&appt).await.unwrap_err().is_retryable());
        assert!(store.create(&appt).await.is_ok());
        assert_eq!(store.calls(StoreOp::Create), 3);
        assert_eq!(store.injected(), 2);

        store.fail_schema("source_private_id");
        assert!(matches!(
            store.create(&appt).await,
            Err(StoreError::SchemaMissing { .. })
        ));
        store.heal();
        assert!(store.create(&appt).await.is_ok());
    }

    #[tokio::test]
    async fn test_link_back_fault_spares_other_updates() {
        let store = FlakyStore::new(Arc::new(MemoryStore::new("private", StoreKind::Private)));
        let tz = FixedOffset::east_opt(0).unwrap();
        let id = store
            .create(&Appointment::new(
                "Flaky",
                tz.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
                tz.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        store.fail_link_back(false);

        let state = AppointmentPatch::sync_state(appt_core::SyncState::Syncing);
        assert!(store.update(&id, &state).await.is_ok());
        assert!(matches!(
            store.update(&id, &AppointmentPatch::link_peer("m1")).await,
            Err(StoreError::Marshalling(_))
        ));
        assert!(store.update(&id, &AppointmentPatch::unlink_peer()).await.is_ok());

        store.heal();
        assert!(store.update(&id, &AppointmentPatch::link_peer("m1")).await.is_ok());
    }
}
