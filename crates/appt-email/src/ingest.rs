//! Business mail ingestion
//!
//! Messages become records in the business store. Business records are never
//! partner relevant, so nothing here ever reaches the sync engine.

use std::path::Path;
use std::sync::Arc;

use appt_calendar::CalendarStore;
use appt_core::{Appointment, StoreKind};
use appt_extract::{normalize, ExtractionError, ExtractionResult, Extractor};
use appt_sync::Deduplicator;
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::MailMessage;

/// What became of one message
#[derive(Debug, Clone, PartialEq)]
pub enum MailOutcome {
    Created {
        id: String,
        appointment: Appointment,
    },
    /// The business store already holds this appointment
    Duplicate { existing_id: String },
    /// Too uncertain or incomplete to file without a human look
    NeedsReview { result: Box<ExtractionResult> },
}

/// Files inbound business mail into the business store
pub struct MailIngestor {
    extractor: Extractor,
    dedup: Deduplicator,
    business: Arc<dyn CalendarStore>,
    timezone: Tz,
}

impl MailIngestor {
    pub fn new(extractor: Extractor, business: Arc<dyn CalendarStore>, timezone: Tz) -> Self {
        Self {
            extractor,
            dedup: Deduplicator::default(),
            business,
            timezone,
        }
    }

    pub fn with_dedup(mut self, dedup: Deduplicator) -> Self {
        self.dedup = dedup;
        self
    }

    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<MailOutcome> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), bytes = raw.len(), "Read message file");
        let message = MailMessage::parse_bytes(&raw)?;
        self.ingest(&message).await
    }

    pub async fn ingest_raw(&self, raw: &str) -> Result<MailOutcome> {
        let message = MailMessage::parse(raw)?;
        self.ingest(&message).await
    }

    /// Extract, validate, deduplicate and store one message.
    ///
    /// Relative dates resolve against the message's own `Date` header, so a
    /// mail saying "tomorrow" means the day after it was sent.
    pub async fn ingest(&self, message: &MailMessage) -> Result<MailOutcome> {
        let reference = message
            .date
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let result = match self
            .extractor
            .extract(&message.extraction_text(), reference, self.timezone)
            .await
        {
            Ok(result) => result,
            Err(ExtractionError::LowConfidence { confidence, result }) => {
                info!(
                    message_id = ?message.message_id,
                    confidence,
                    "Message needs review"
                );
                return Ok(MailOutcome::NeedsReview { result });
            }
            Err(e) => return Err(e.into()),
        };

        if !result.is_complete() {
            info!(
                message_id = ?message.message_id,
                unresolved = ?result.unresolved,
                "Message lacks appointment details"
            );
            return Ok(MailOutcome::NeedsReview {
                result: Box::new(result),
            });
        }

        let appointment = normalize(&result.candidate, self.timezone)?
            .with_partner_relevant(false)
            .with_origin(StoreKind::Business);

        if let Some(existing) = self
            .dedup
            .find_duplicate(self.business.as_ref(), &appointment)
            .await?
        {
            let existing_id = existing.id.unwrap_or_default();
            warn!(
                message_id = ?message.message_id,
                existing_id = %existing_id,
                "Business appointment already on file"
            );
            return Ok(MailOutcome::Duplicate { existing_id });
        }

        let id = self.business.create(&appointment).await?;
        info!(
            id = %id,
            title = %appointment.title,
            start = %appointment.start,
            store = %self.business.name(),
            "Business appointment filed"
        );
        Ok(MailOutcome::Created { id, appointment })
    }
}
