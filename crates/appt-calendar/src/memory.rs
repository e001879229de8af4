//! In-memory calendar store

use std::collections::HashMap;

use appt_core::{Appointment, AppointmentPatch, StoreKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::{sort_by_creation, CalendarStore, StoreQuery};

/// Process-local store (useful for testing and development)
pub struct MemoryStore {
    name: String,
    kind: StoreKind,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Appointment>,
    last_created: Option<DateTime<Utc>>,
}

impl Inner {
    /// Creation timestamps are strictly increasing so "earliest created" is total
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created = match self.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(created);
        created
    }
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, kind: StoreKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }

    /// Every record, oldest first
    pub async fn all(&self) -> Vec<Appointment> {
        let mut records: Vec<_> = self.inner.read().await.records.values().cloned().collect();
        sort_by_creation(&mut records);
        records
    }
}

#[async_trait]
impl CalendarStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn create(&self, record: &Appointment) -> Result<String> {
        let id = uuid::Uuid::now_v7().to_string();
        let mut stored = record.clone();
        stored.id = Some(id.clone());
        stored.origin = self.kind;

        let mut inner = self.inner.write().await;
        stored.created_at = Some(inner.next_created_at());
        inner.records.insert(id.clone(), stored);
        debug!(store = %self.name, id = %id, "Created record");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: &AppointmentPatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(record);
        debug!(store = %self.name, id = %id, "Updated record");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.inner.write().await.records.remove(id) {
            Some(_) => {
                debug!(store = %self.name, id = %id, "Deleted record");
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn find(&self, query: &StoreQuery) -> Result<Vec<Appointment>> {
        let mut found: Vec<_> = self
            .inner
            .read()
            .await
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        sort_by_creation(&mut found);
        Ok(found)
    }
}
