//! Ingestion orchestrator
//!
//! Wires extraction, normalization, the user's private store and the sync
//! dispatcher together. Every edit goes through here so the before/after
//! pair can be handed to the sync planner.

use std::collections::HashMap;
use std::sync::Arc;

use appt_calendar::{open_store, CalendarStore, StoreQuery};
use appt_core::{
    Appointment, AppointmentPatch, Config, StoreKind, SyncState, TextGenerator, UserContext,
};
use appt_extract::{normalize, ExtractionError, ExtractionResult, Extractor};
use appt_sync::{
    plan, plan_resync, Deduplicator, RetryPolicy, SyncDispatcher, SyncEngine, SyncReport,
    SyncTask, SyncTicket,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};

/// Result of turning one message into an appointment
#[derive(Debug)]
pub enum IngestOutcome {
    Created {
        id: String,
        appointment: Appointment,
        /// Present when the appointment is partner relevant
        sync: Option<SyncTicket>,
    },
    /// The private store already holds this appointment
    Duplicate { existing_id: String },
    /// Confidence under the floor, or fields missing: ask the user
    NeedsClarification { result: Box<ExtractionResult> },
}

/// Where a record stands with respect to its mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub partner_relevant: bool,
    pub mirror_id: Option<String>,
}

struct UserSession {
    context: UserContext,
    store: Arc<dyn CalendarStore>,
}

/// Front-end facing operations over every configured user
pub struct AppointmentService {
    extractor: Extractor,
    dedup: Deduplicator,
    users: HashMap<String, UserSession>,
    shared: Arc<dyn CalendarStore>,
    dispatcher: SyncDispatcher,
}

impl AppointmentService {
    /// Build the service from explicit stores. Returns the channel on which
    /// terminal sync failures are reported.
    pub fn new(
        config: &Config,
        generator: Arc<dyn TextGenerator>,
        shared: Arc<dyn CalendarStore>,
        users: Vec<(UserContext, Arc<dyn CalendarStore>)>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncReport>) {
        let dedup = Deduplicator::from_config(&config.dedup);

        let mut engine = SyncEngine::new(shared.clone())
            .with_dedup(dedup.clone())
            .with_retry(RetryPolicy::from_config(&config.sync));
        let mut sessions = HashMap::new();
        for (context, store) in users {
            engine = engine.with_user(context.user_id.clone(), store.clone());
            sessions.insert(context.user_id.clone(), UserSession { context, store });
        }

        let (dispatcher, reports) = SyncDispatcher::new(Arc::new(engine), config.sync.concurrency);
        let extractor = Extractor::from_config(generator, &config.extraction, config.llm.timeout());

        let service = Self {
            extractor,
            dedup,
            users: sessions,
            shared,
            dispatcher,
        };
        (service, reports)
    }

    /// Open every configured store and build the service
    pub fn from_config(
        config: &Config,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncReport>)> {
        let shared = open_store(&config.stores.shared, "shared", StoreKind::Shared)?;

        let mut users = Vec::with_capacity(config.users.len());
        for user in &config.users {
            let context = user.context()?;
            let name = format!("private-{}", user.id);
            let store = open_store(&user.private_store(), &name, StoreKind::Private)?;
            info!(user = %user.id, timezone = %context.timezone, store = %name, "User configured");
            users.push((context, store));
        }

        Ok(Self::new(config, generator, shared, users))
    }

    pub fn user_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.users.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn context(&self, user_id: &str) -> Result<&UserContext> {
        Ok(&self.session(user_id)?.context)
    }

    pub fn shared_store(&self) -> &Arc<dyn CalendarStore> {
        &self.shared
    }

    pub fn dispatcher(&self) -> &SyncDispatcher {
        &self.dispatcher
    }

    fn session(&self, user_id: &str) -> Result<&UserSession> {
        self.users
            .get(user_id)
            .ok_or_else(|| GatewayError::UnknownUser(user_id.to_string()))
    }

    pub async fn ingest(&self, user_id: &str, text: &str) -> Result<IngestOutcome> {
        self.ingest_at(user_id, text, Utc::now()).await
    }

    /// Extract, validate, deduplicate, store and (when partner relevant)
    /// queue the mirror. Relative dates resolve against `reference`.
    pub async fn ingest_at(
        &self,
        user_id: &str,
        text: &str,
        reference: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let session = self.session(user_id)?;
        let timezone = session.context.timezone;

        let result = match self.extractor.extract(text, reference, timezone).await {
            Ok(result) if result.is_complete() => result,
            Ok(result) => {
                return Ok(IngestOutcome::NeedsClarification {
                    result: Box::new(result),
                });
            }
            Err(ExtractionError::LowConfidence { result, .. }) => {
                return Ok(IngestOutcome::NeedsClarification { result });
            }
            Err(e) => return Err(e.into()),
        };

        let appointment = normalize(&result.candidate, timezone)?.with_origin(StoreKind::Private);

        if let Some(existing) = self
            .dedup
            .find_duplicate(session.store.as_ref(), &appointment)
            .await?
        {
            let existing_id = existing.id.unwrap_or_default();
            info!(user = %user_id, existing_id = %existing_id, "Appointment already on file");
            return Ok(IngestOutcome::Duplicate { existing_id });
        }

        let id = session.store.create(&appointment).await?;
        info!(
            user = %user_id,
            id = %id,
            title = %appointment.title,
            start = %appointment.start,
            partner_relevant = appointment.partner_relevant,
            "Appointment created"
        );

        let created = session.store.get(&id).await?;
        let sync = self.dispatch(user_id, &id, None, created.as_ref());
        Ok(IngestOutcome::Created {
            id,
            appointment,
            sync,
        })
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<Appointment> {
        self.session(user_id)?
            .store
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// The user's appointments ordered by start
    pub async fn list(&self, user_id: &str) -> Result<Vec<Appointment>> {
        let mut records = self
            .session(user_id)?
            .store
            .find(&StoreQuery::title_prefix(""))
            .await?;
        records.sort_by_key(|r| r.start);
        Ok(records)
    }

    /// Apply `patch` and queue whatever sync work the change implies
    pub async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: &AppointmentPatch,
    ) -> Result<Option<SyncTicket>> {
        let store = &self.session(user_id)?.store;
        let before = self.get(user_id, id).await?;

        store.update(id, patch).await?;
        let after = store.get(id).await?;
        debug!(user = %user_id, id = %id, "Appointment updated");

        Ok(self.dispatch(user_id, id, Some(&before), after.as_ref()))
    }

    pub async fn set_partner_relevant(
        &self,
        user_id: &str,
        id: &str,
        partner_relevant: bool,
    ) -> Result<Option<SyncTicket>> {
        let patch = AppointmentPatch::default().with_partner_relevant(partner_relevant);
        self.update(user_id, id, &patch).await
    }

    /// Flip the partner flag; returns the new value
    pub async fn toggle(&self, user_id: &str, id: &str) -> Result<(bool, Option<SyncTicket>)> {
        let relevant = !self.get(user_id, id).await?.partner_relevant;
        let ticket = self.set_partner_relevant(user_id, id, relevant).await?;
        Ok((relevant, ticket))
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<Option<SyncTicket>> {
        let before = self.get(user_id, id).await?;
        self.session(user_id)?.store.delete(id).await?;
        info!(user = %user_id, id = %id, "Appointment deleted");

        Ok(self.dispatch(user_id, id, Some(&before), None))
    }

    /// Re-drive sync for a record, typically one left `SyncFailed`
    pub async fn resync(&self, user_id: &str, id: &str) -> Result<Option<SyncTicket>> {
        let record = self.get(user_id, id).await?;
        let Some(operation) = plan_resync(&record) else {
            debug!(user = %user_id, id = %id, "Nothing to re-sync");
            return Ok(None);
        };

        info!(user = %user_id, id = %id, previous = %record.tracking.sync_state, "Re-sync requested");
        Ok(Some(self.dispatcher.submit(SyncTask::new(id, user_id, operation))))
    }

    pub async fn sync_status(&self, user_id: &str, id: &str) -> Result<SyncStatus> {
        let record = self.get(user_id, id).await?;
        Ok(SyncStatus {
            state: record.tracking.sync_state,
            partner_relevant: record.partner_relevant,
            mirror_id: record.tracking.synced_peer_id,
        })
    }

    fn dispatch(
        &self,
        user_id: &str,
        id: &str,
        before: Option<&Appointment>,
        after: Option<&Appointment>,
    ) -> Option<SyncTicket> {
        let operation = plan(before, after)?;
        debug!(user = %user_id, id = %id, operation = %operation, "Sync queued");
        Some(self.dispatcher.submit(SyncTask::new(id, user_id, operation)))
    }
}

/// Log terminal sync failures as they arrive
pub fn spawn_report_logger(mut reports: mpsc::UnboundedReceiver<SyncReport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            error!(
                task = %report.task,
                error = %report.error,
                "Sync gave up; the record stays marked until edited or re-synced"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use appt_calendar::testing::{FlakyStore, StoreOp};
    use appt_calendar::MemoryStore;
    use appt_core::SyncConfig;
    use appt_sync::{SyncError, SyncOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies from a queue; the last reply repeats
    struct ScriptedGenerator(Mutex<Vec<String>>);

    impl ScriptedGenerator {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(
                replies.iter().rev().map(|r| r.to_string()).collect(),
            )))
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _system: &str, _prompt: &str) -> appt_core::Result<String> {
            let mut replies = self.0.lock().unwrap();
            if replies.len() > 1 {
                Ok(replies.pop().unwrap())
            } else {
                Ok(replies.last().cloned().unwrap_or_default())
            }
        }
    }

    const DINNER: &str = r#"{"title": "Dinner with Sam", "date": "2025-06-10", "time": "19:00", "partner_relevant": true, "confidence": 0.9}"#;
    const DENTIST: &str = r#"{"title": "Dentist", "date": "2025-06-11", "time": "08:30", "duration_minutes": 30, "confidence": 0.9}"#;

    struct Fixture {
        service: AppointmentService,
        private: Arc<dyn CalendarStore>,
        shared: Arc<FlakyStore>,
        _reports: mpsc::UnboundedReceiver<SyncReport>,
    }

    fn fixture(replies: &[&str]) -> Fixture {
        let config = Config {
            sync: SyncConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let private: Arc<dyn CalendarStore> =
            Arc::new(MemoryStore::new("private-alice", StoreKind::Private));
        let shared = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new(
            "shared",
            StoreKind::Shared,
        ))));
        let alice = UserContext::new("alice", chrono_tz::Europe::Berlin);

        let (service, reports) = AppointmentService::new(
            &config,
            ScriptedGenerator::new(replies),
            shared.clone(),
            vec![(alice, private.clone())],
        );
        Fixture {
            service,
            private,
            shared,
            _reports: reports,
        }
    }

    async fn mirrors(f: &Fixture) -> Vec<Appointment> {
        f.shared
            .inner()
            .find(&StoreQuery::title_prefix(""))
            .await
            .unwrap()
    }

    async fn ingest_created(f: &Fixture, text: &str) -> (String, Option<SyncTicket>) {
        match f.service.ingest("alice", text).await.unwrap() {
            IngestOutcome::Created { id, sync, .. } => (id, sync),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_partner_relevant_mirrors() {
        let f = fixture(&[DINNER]);
        let (id, sync) = ingest_created(&f, "Dinner with Sam on 2025-06-10 at 7pm").await;

        let outcome = sync.expect("partner relevant").wait().await.unwrap();
        let SyncOutcome::Mirrored { mirror_id, .. } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };

        let record = f.service.get("alice", &id).await.unwrap();
        assert_eq!(record.start.to_rfc3339(), "2025-06-10T19:00:00+02:00");
        assert_eq!(record.duration(), chrono::Duration::minutes(60));
        assert_eq!(
            f.service.sync_status("alice", &id).await.unwrap(),
            SyncStatus {
                state: SyncState::Synced,
                partner_relevant: true,
                mirror_id: Some(mirror_id.clone()),
            }
        );

        let shared = mirrors(&f).await;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id.as_deref(), Some(mirror_id.as_str()));
        assert_eq!(shared[0].tracking.source_private_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_private_ingest_stays_private() {
        let f = fixture(&[DENTIST]);
        let (id, sync) = ingest_created(&f, "Dentist 2025-06-11 8:30 for 30 minutes").await;
        assert!(sync.is_none());

        let record = f.service.get("alice", &id).await.unwrap();
        assert_eq!(record.duration(), chrono::Duration::minutes(30));
        assert_eq!(record.tracking.sync_state, SyncState::Unsynced);
        assert!(mirrors(&f).await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_input_is_a_duplicate() {
        let f = fixture(&[DENTIST]);
        let (id, _) = ingest_created(&f, "Dentist 2025-06-11 8:30").await;

        let again = f.service.ingest("alice", "Dentist 2025-06-11 8:30").await.unwrap();
        assert!(matches!(again, IngestOutcome::Duplicate { existing_id } if existing_id == id));
        assert_eq!(f.service.list("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uncertain_input_asks_for_clarification() {
        let f = fixture(&[r#"{"title": "Something", "confidence": 0.3}"#]);
        let outcome = f.service.ingest("alice", "something sometime").await.unwrap();
        assert!(matches!(outcome, IngestOutcome::NeedsClarification { .. }));

        let f = fixture(&[r#"{"title": "Party", "date": "2025-06-14", "confidence": 0.9}"#]);
        let outcome = f.service.ingest("alice", "party on 2025-06-14").await.unwrap();
        let IngestOutcome::NeedsClarification { result } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(result.unresolved, vec!["time"]);
        assert!(f.service.list("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reply_is_typed() {
        let f = fixture(&["I'd love to help!"]);
        assert!(matches!(
            f.service.ingest("alice", "lunch").await,
            Err(GatewayError::Extraction(ExtractionError::MalformedResponse(_)))
        ));
    }

    #[tokio::test]
    async fn test_toggle_and_edit_follow_through() {
        let f = fixture(&[DENTIST]);
        let (id, _) = ingest_created(&f, "Dentist 2025-06-11 8:30").await;

        let (relevant, ticket) = f.service.toggle("alice", &id).await.unwrap();
        assert!(relevant);
        let SyncOutcome::Mirrored { mirror_id: first, .. } =
            ticket.unwrap().wait().await.unwrap()
        else {
            panic!("expected a mirror");
        };

        let mut edited = f.service.get("alice", &id).await.unwrap();
        edited.location = Some("Praxis Weber".to_string());
        let ticket = f
            .service
            .update("alice", &id, &AppointmentPatch::content_from(&edited))
            .await
            .unwrap();
        assert_eq!(
            ticket.unwrap().wait().await.unwrap(),
            SyncOutcome::Updated { mirror_id: first.clone() }
        );
        let mirror = f.shared.inner().get(&first).await.unwrap().unwrap();
        assert_eq!(mirror.location.as_deref(), Some("Praxis Weber"));

        let (relevant, ticket) = f.service.toggle("alice", &id).await.unwrap();
        assert!(!relevant);
        ticket.unwrap().wait().await.unwrap();
        assert!(mirrors(&f).await.is_empty());
        assert_eq!(f.service.sync_status("alice", &id).await.unwrap().mirror_id, None);

        let (_, ticket) = f.service.toggle("alice", &id).await.unwrap();
        let SyncOutcome::Mirrored { mirror_id: second, .. } =
            ticket.unwrap().wait().await.unwrap()
        else {
            panic!("expected a mirror");
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_delete_after_mirror_removed_by_hand() {
        let f = fixture(&[DINNER]);
        let (id, sync) = ingest_created(&f, "Dinner with Sam on 2025-06-10 at 7pm").await;
        let SyncOutcome::Mirrored { mirror_id, .. } = sync.unwrap().wait().await.unwrap() else {
            panic!("expected a mirror");
        };
        f.shared.inner().delete(&mirror_id).await.unwrap();

        let ticket = f.service.delete("alice", &id).await.unwrap().unwrap();
        assert_eq!(
            ticket.wait().await.unwrap(),
            SyncOutcome::Removed { mirror_ids: vec![] }
        );
        assert!(f.private.get(&id).await.unwrap().is_none());
        assert!(matches!(
            f.service.get("alice", &id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_sync_can_be_resynced() {
        let f = fixture(&[DINNER]);
        f.shared.fail_next(StoreOp::Create, 2);

        let (id, sync) = ingest_created(&f, "Dinner with Sam on 2025-06-10 at 7pm").await;
        assert!(matches!(
            sync.unwrap().wait().await,
            Err(SyncError::RetriesExhausted { attempts: 2, .. })
        ));
        let record = f.private.get(&id).await.unwrap().unwrap();
        assert_eq!(record.tracking.sync_state, SyncState::SyncFailed);
        assert_eq!(record.title, "Dinner with Sam");

        let ticket = f.service.resync("alice", &id).await.unwrap().unwrap();
        assert!(matches!(
            ticket.wait().await,
            Ok(SyncOutcome::Mirrored { reused: false, .. })
        ));
        assert_eq!(
            f.service.sync_status("alice", &id).await.unwrap().state,
            SyncState::Synced
        );
        assert_eq!(mirrors(&f).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let f = fixture(&[DINNER]);
        assert!(matches!(
            f.service.ingest("bob", "dinner").await,
            Err(GatewayError::UnknownUser(_))
        ));
        assert_eq!(f.service.user_ids(), vec!["alice"]);
    }
}
