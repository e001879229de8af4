//! Sync engine: mirrors partner-relevant private records into the shared store
//!
//! Every task is idempotent, so a failed attempt is retried by running the
//! whole task again. Mirrors are located by tracking identity before any
//! write, which is what lets a re-driven `create` adopt a mirror left behind
//! by an earlier attempt instead of writing a second one.

use std::collections::HashMap;
use std::sync::Arc;

use appt_calendar::{CalendarStore, StoreQuery};
use appt_core::{Appointment, AppointmentPatch, SyncState};
use dashmap::DashSet;
use tracing::{debug, error, info, warn};

use crate::dedup::Deduplicator;
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::task::{SyncOperation, SyncOutcome, SyncTask};

/// Executes sync tasks against one shared store and per-user private stores
pub struct SyncEngine {
    shared: Arc<dyn CalendarStore>,
    private: HashMap<String, Arc<dyn CalendarStore>>,
    dedup: Deduplicator,
    retry: RetryPolicy,
    /// `store/field` pairs already reported as missing
    schema_reported: DashSet<String>,
}

impl SyncEngine {
    pub fn new(shared: Arc<dyn CalendarStore>) -> Self {
        Self {
            shared,
            private: HashMap::new(),
            dedup: Deduplicator::default(),
            retry: RetryPolicy::default(),
            schema_reported: DashSet::new(),
        }
    }

    /// Register `user_id`'s private store
    pub fn with_user(mut self, user_id: impl Into<String>, store: Arc<dyn CalendarStore>) -> Self {
        self.private.insert(user_id.into(), store);
        self
    }

    pub fn with_dedup(mut self, dedup: Deduplicator) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn shared_store(&self) -> &Arc<dyn CalendarStore> {
        &self.shared
    }

    pub fn private_store(&self, user_id: &str) -> Result<&Arc<dyn CalendarStore>> {
        self.private
            .get(user_id)
            .ok_or_else(|| SyncError::UnknownUser(user_id.to_string()))
    }

    /// Run `task` to completion with bounded retries.
    ///
    /// Only terminal failures come back as errors: `SchemaMissing`, and
    /// `RetriesExhausted` for everything else that could not be completed.
    /// A duplicate owned by someone else is logged and reported as
    /// [`SyncOutcome::DuplicateSkipped`].
    pub async fn run(&self, task: &SyncTask) -> Result<SyncOutcome> {
        let private = self.private_store(&task.user_id)?.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.execute(private.as_ref(), task).await {
                Ok(outcome) => {
                    info!(task = %task, ?outcome, attempt, "Sync task completed");
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            match error {
                SyncError::DuplicateDetected { existing_id, .. } => {
                    warn!(
                        task = %task,
                        existing_id = %existing_id,
                        "Shared store already holds this appointment; no mirror written"
                    );
                    self.mark(private.as_ref(), task, SyncState::Unsynced).await;
                    return Ok(SyncOutcome::DuplicateSkipped { existing_id });
                }
                e if e.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(task = %task, attempt, ?delay, error = %e, "Sync attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                e if e.is_retryable() => {
                    error!(task = %task, attempts = attempt, error = %e, "Sync retries exhausted");
                    self.mark(private.as_ref(), task, SyncState::SyncFailed).await;
                    return Err(SyncError::RetriesExhausted {
                        record_id: task.private_record_id.clone(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                e @ SyncError::SchemaMissing { .. } => {
                    self.report_fatal(task, &e);
                    self.mark(private.as_ref(), task, SyncState::SyncFailed).await;
                    return Err(e);
                }
                e => {
                    self.report_fatal(task, &e);
                    self.mark(private.as_ref(), task, SyncState::SyncFailed).await;
                    return Err(SyncError::RetriesExhausted {
                        record_id: task.private_record_id.clone(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn execute(&self, private: &dyn CalendarStore, task: &SyncTask) -> Result<SyncOutcome> {
        match task.operation {
            SyncOperation::Create => self.execute_create(private, task).await,
            SyncOperation::Update => self.execute_update(private, task).await,
            SyncOperation::Delete => self.execute_delete(private, task).await,
        }
    }

    async fn execute_create(&self, private: &dyn CalendarStore, task: &SyncTask) -> Result<SyncOutcome> {
        let Some(record) = self.load_relevant(private, task).await? else {
            return Ok(SyncOutcome::NothingToDo);
        };
        let id = &task.private_record_id;

        // Adopt a mirror from an earlier attempt
        if let Some(mirror) = self.claim_mirror(task, &record).await? {
            let mirror_id = self.refresh_mirror(&record, &mirror).await?;
            self.link(private, id, &mirror_id).await?;
            return Ok(SyncOutcome::Mirrored {
                mirror_id,
                reused: true,
            });
        }

        if let Some(existing) = self
            .dedup
            .find_duplicate(self.shared.as_ref(), &record)
            .await
            .map_err(|e| SyncError::from_store(self.shared.name(), e))?
        {
            return Err(SyncError::DuplicateDetected {
                record_id: id.clone(),
                existing_id: existing.id.unwrap_or_default(),
            });
        }

        let mirror = record.to_mirror(&task.user_id, id);
        let mirror_id = self
            .shared
            .create(&mirror)
            .await
            .map_err(|e| SyncError::from_store(self.shared.name(), e))?;
        debug!(record_id = %id, mirror_id = %mirror_id, "Mirror written");

        // If this fails the retry adopts the mirror just written
        self.link(private, id, &mirror_id).await?;
        Ok(SyncOutcome::Mirrored {
            mirror_id,
            reused: false,
        })
    }

    async fn execute_update(&self, private: &dyn CalendarStore, task: &SyncTask) -> Result<SyncOutcome> {
        let Some(record) = self.load_relevant(private, task).await? else {
            return Ok(SyncOutcome::NothingToDo);
        };

        match self.claim_mirror(task, &record).await? {
            Some(mirror) => {
                let mirror_id = self.refresh_mirror(&record, &mirror).await?;
                self.link(private, &task.private_record_id, &mirror_id).await?;
                Ok(SyncOutcome::Updated { mirror_id })
            }
            None => {
                info!(record_id = %task.private_record_id, "Mirror missing, recreating");
                self.execute_create(private, task).await
            }
        }
    }

    async fn execute_delete(&self, private: &dyn CalendarStore, task: &SyncTask) -> Result<SyncOutcome> {
        let id = &task.private_record_id;
        let record = private
            .get(id)
            .await
            .map_err(|e| SyncError::from_store(private.name(), e))?;
        let peer = record.as_ref().and_then(|r| r.tracking.synced_peer_id.clone());

        let mut removed = Vec::new();
        for mirror in self.owned_mirrors(task, peer.as_deref()).await? {
            let Some(mirror_id) = mirror.id else { continue };
            match self.shared.delete(&mirror_id).await {
                Ok(()) => removed.push(mirror_id),
                Err(e) if e.is_not_found() => debug!(mirror_id = %mirror_id, "Mirror already gone"),
                Err(e) => return Err(SyncError::from_store(self.shared.name(), e)),
            }
        }

        if record.is_some() {
            match private.update(id, &AppointmentPatch::unlink_peer()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(SyncError::from_store(private.name(), e)),
            }
        }

        Ok(SyncOutcome::Removed {
            mirror_ids: removed,
        })
    }

    /// The private record, if it still wants a mirror. Marks it `Syncing`.
    async fn load_relevant(&self, private: &dyn CalendarStore, task: &SyncTask) -> Result<Option<Appointment>> {
        let id = &task.private_record_id;
        let record = private
            .get(id)
            .await
            .map_err(|e| SyncError::from_store(private.name(), e))?;

        let Some(record) = record else {
            debug!(record_id = %id, "Private record gone, nothing to mirror");
            return Ok(None);
        };
        if !record.partner_relevant {
            debug!(record_id = %id, "Record no longer partner relevant");
            return Ok(None);
        }

        private
            .update(id, &AppointmentPatch::sync_state(SyncState::Syncing))
            .await
            .map_err(|e| SyncError::from_store(private.name(), e))?;
        Ok(Some(record))
    }

    /// Engine-written mirrors of this task's record, oldest first
    async fn owned_mirrors(&self, task: &SyncTask, peer: Option<&str>) -> Result<Vec<Appointment>> {
        let shared_err = |e| SyncError::from_store(self.shared.name(), e);
        let owned = |m: &Appointment| {
            m.tracking.source_private_id.as_deref() == Some(task.private_record_id.as_str())
                && m.tracking.source_user_id.as_deref() == Some(task.user_id.as_str())
        };

        let mut mirrors: Vec<Appointment> = Vec::new();
        if let Some(peer) = peer {
            if let Some(mirror) = self.shared.get(peer).await.map_err(shared_err)? {
                if owned(&mirror) {
                    mirrors.push(mirror);
                }
            }
        }

        let found = self
            .shared
            .find(&StoreQuery::source_private_id(task.private_record_id.as_str()))
            .await
            .map_err(shared_err)?;
        for mirror in found {
            if owned(&mirror) && !mirrors.iter().any(|m| m.id == mirror.id) {
                mirrors.push(mirror);
            }
        }

        mirrors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(mirrors)
    }

    /// Keep the earliest owned mirror and remove any others
    async fn claim_mirror(&self, task: &SyncTask, record: &Appointment) -> Result<Option<Appointment>> {
        let mut mirrors = self
            .owned_mirrors(task, record.tracking.synced_peer_id.as_deref())
            .await?
            .into_iter();
        let Some(keep) = mirrors.next() else {
            return Ok(None);
        };

        for extra in mirrors {
            let Some(extra_id) = extra.id else { continue };
            warn!(record_id = %task.private_record_id, mirror_id = %extra_id, "Removing surplus mirror");
            match self.shared.delete(&extra_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(SyncError::from_store(self.shared.name(), e)),
            }
        }
        Ok(Some(keep))
    }

    /// Bring `mirror` in line with `record`; returns the mirror's identity
    async fn refresh_mirror(&self, record: &Appointment, mirror: &Appointment) -> Result<String> {
        let mirror_id = mirror
            .id
            .clone()
            .ok_or_else(|| SyncError::Store("mirror without identity".to_string()))?;

        if record.content_differs(mirror) {
            self.shared
                .update(&mirror_id, &AppointmentPatch::content_from(record))
                .await
                .map_err(|e| match e {
                    // Removed between lookup and write: retry recreates it
                    e if e.is_not_found() => SyncError::StoreUnavailable(format!(
                        "mirror {} vanished during update",
                        mirror_id
                    )),
                    e => SyncError::from_store(self.shared.name(), e),
                })?;
            debug!(mirror_id = %mirror_id, "Mirror content refreshed");
        }
        Ok(mirror_id)
    }

    async fn link(&self, private: &dyn CalendarStore, record_id: &str, mirror_id: &str) -> Result<()> {
        private
            .update(record_id, &AppointmentPatch::link_peer(mirror_id))
            .await
            .map_err(|e| SyncError::from_store(private.name(), e))
    }

    /// Best-effort sync-state marker write; the authoritative fields are untouched
    async fn mark(&self, private: &dyn CalendarStore, task: &SyncTask, state: SyncState) {
        let patch = AppointmentPatch::sync_state(state);
        match private.update(&task.private_record_id, &patch).await {
            Ok(()) => debug!(record_id = %task.private_record_id, state = %state, "Sync state marked"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                record_id = %task.private_record_id,
                state = %state,
                error = %e,
                "Failed to write sync state"
            ),
        }
    }

    fn report_fatal(&self, task: &SyncTask, error: &SyncError) {
        if let SyncError::SchemaMissing { store, field } = error {
            if !self.schema_reported.insert(format!("{}/{}", store, field)) {
                debug!(task = %task, store = %store, field = %field, "Schema problem already reported");
                return;
            }
        }
        error!(task = %task, error = %error, "Sync task failed");
    }
}
