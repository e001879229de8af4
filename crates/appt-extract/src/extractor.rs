//! Extraction engine

use std::sync::Arc;
use std::time::Duration;

use appt_core::{ExtractionConfig, TextGenerator};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::error::{ExtractionError, Result};
use crate::parse::{parse_reply, RawReply};
use crate::prompt::system_prompt;
use crate::relative::{resolve_date, resolve_time};
use crate::types::{AppointmentCandidate, ExtractionResult, DEFAULT_DURATION_MINUTES};

/// Confidence used when the backend does not report one
const UNREPORTED_CONFIDENCE: f32 = 0.5;

/// Turns free text into an [`ExtractionResult`] through a generation backend
pub struct Extractor {
    generator: Arc<dyn TextGenerator>,
    confidence_floor: f32,
    default_duration: u32,
    timeout: Duration,
}

impl Extractor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::from_config(generator, &ExtractionConfig::default(), Duration::from_secs(30))
    }

    pub fn from_config(
        generator: Arc<dyn TextGenerator>,
        config: &ExtractionConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            confidence_floor: config.confidence_floor.clamp(0.0, 1.0) as f32,
            default_duration: u32::try_from(config.default_duration_minutes)
                .ok()
                .filter(|m| *m > 0)
                .unwrap_or(DEFAULT_DURATION_MINUTES),
            timeout,
        }
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Extract one appointment candidate from `text`.
    ///
    /// Relative phrases resolve against `reference_instant` as seen in
    /// `timezone`. A result under the confidence floor comes back as
    /// [`ExtractionError::LowConfidence`] carrying the partial result.
    pub async fn extract(
        &self,
        text: &str,
        reference_instant: DateTime<Utc>,
        timezone: Tz,
    ) -> Result<ExtractionResult> {
        let system = system_prompt(reference_instant, timezone, self.default_duration);

        debug!(chars = text.len(), "Requesting extraction");
        let reply = match tokio::time::timeout(self.timeout, self.generator.generate(&system, text)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(appt_core::Error::Timeout)) | Err(_) => {
                warn!(timeout = ?self.timeout, "Extraction timed out");
                return Err(ExtractionError::Timeout(self.timeout));
            }
            Ok(Err(e)) => return Err(ExtractionError::Generation(e.to_string())),
        };

        let raw = parse_reply(&reply)?;
        let reference_date = reference_instant.with_timezone(&timezone).date_naive();
        let candidate = self.build_candidate(&raw, text, reference_date);

        let unresolved = candidate.unresolved();
        let confidence = raw.confidence().unwrap_or(UNREPORTED_CONFIDENCE);
        let result = ExtractionResult {
            raw_text: text.to_string(),
            candidate,
            confidence,
            unresolved,
        };

        if confidence < self.confidence_floor {
            info!(
                confidence,
                floor = self.confidence_floor,
                "Extraction needs clarification"
            );
            return Err(ExtractionError::LowConfidence {
                confidence,
                result: Box::new(result),
            });
        }

        info!(
            confidence,
            unresolved = result.unresolved.len(),
            "Extracted candidate"
        );
        Ok(result)
    }

    /// Fill a candidate from the reply, falling back to the user's own words
    /// for dates and times the backend left out or garbled.
    fn build_candidate(&self, raw: &RawReply, text: &str, reference_date: NaiveDate) -> AppointmentCandidate {
        let date = raw
            .date
            .as_deref()
            .and_then(|d| resolve_date(d, reference_date))
            .or_else(|| resolve_date(text, reference_date));
        let time = raw
            .time
            .as_deref()
            .and_then(resolve_time)
            .or_else(|| resolve_time(text));
        let end = raw
            .end
            .as_deref()
            .and_then(|e| parse_end(e, date.unwrap_or(reference_date)));

        AppointmentCandidate {
            title: raw
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            date,
            time,
            duration_minutes: Some(raw.duration().unwrap_or(self.default_duration)),
            end,
            description: raw.description.clone(),
            location: raw.location.clone(),
            tags: raw.tags.clone().unwrap_or_default(),
            partner_relevant: raw.partner_relevant.unwrap_or(false),
        }
    }
}

/// Local end as `YYYY-MM-DDTHH:MM[:SS]`, or a bare time on `date`
fn parse_end(value: &str, date: NaiveDate) -> Option<NaiveDateTime> {
    let value = value.trim();
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(end) = NaiveDateTime::parse_from_str(value, format) {
            return Some(end);
        }
    }
    resolve_time(value).map(|t| date.and_time(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone};
    use std::sync::Mutex;

    /// Replies from a script, one per call
    struct ScriptedGenerator {
        replies: Mutex<Vec<appt_core::Result<String>>>,
        delay: Option<Duration>,
    }

    impl ScriptedGenerator {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Ok(reply.to_string())]),
                delay: None,
            })
        }

        fn slow(reply: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Ok(reply.to_string())]),
                delay: Some(delay),
            })
        }

        fn failing(error: appt_core::Error) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Err(error)]),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _system: &str, _prompt: &str) -> appt_core::Result<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn reference() -> DateTime<Utc> {
        // Wednesday 2025-03-12, 10:00 in Berlin
        Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_explicit_fields_default_to_one_hour() {
        let generator = ScriptedGenerator::new(
            r#"{"title": "Dentist", "date": "2025-03-14", "time": "09:30", "confidence": 0.9}"#,
        );
        let extractor = Extractor::new(generator);

        let result = extractor
            .extract("Dentist on 2025-03-14 at 9:30", reference(), chrono_tz::Europe::Berlin)
            .await
            .unwrap();
        assert!(result.is_complete());

        let appt = normalize(&result.candidate, chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(appt.start.to_rfc3339(), "2025-03-14T09:30:00+01:00");
        assert_eq!(appt.duration(), chrono::Duration::minutes(60));
    }

    #[tokio::test]
    async fn test_stated_duration_is_used() {
        let generator = ScriptedGenerator::new(
            "Here you go:\n```json\n{\"title\": \"Run\", \"date\": \"tomorrow\", \"time\": \"7am\", \"duration_minutes\": 45, \"confidence\": 0.8}\n```",
        );
        let extractor = Extractor::new(generator);

        let result = extractor
            .extract("45 minute run tomorrow 7am", reference(), Tz::UTC)
            .await
            .unwrap();
        assert_eq!(result.candidate.date, NaiveDate::from_ymd_opt(2025, 3, 13));

        let appt = normalize(&result.candidate, Tz::UTC).unwrap();
        assert_eq!(appt.duration(), chrono::Duration::minutes(45));
    }

    #[tokio::test]
    async fn test_missing_date_falls_back_to_input_text() {
        let generator = ScriptedGenerator::new(
            r#"Sure! {"title":"Meeting", "confidence": 0.7} Let me know if you need anything else!"#,
        );
        let extractor = Extractor::new(generator);

        let result = extractor
            .extract("Meeting next friday at 15:00", reference(), Tz::UTC)
            .await
            .unwrap();
        assert_eq!(result.candidate.title.as_deref(), Some("Meeting"));
        assert_eq!(result.candidate.date, NaiveDate::from_ymd_opt(2025, 3, 21));
        assert_eq!(result.candidate.time, NaiveTime::from_hms_opt(15, 0, 0));
    }

    #[tokio::test]
    async fn test_low_confidence_carries_partial_result() {
        let generator = ScriptedGenerator::new(r#"{"title": "Something", "confidence": 0.2}"#);
        let extractor = Extractor::new(generator).with_confidence_floor(0.6);

        let err = extractor
            .extract("something sometime", reference(), Tz::UTC)
            .await
            .unwrap_err();
        let partial = err.partial_result().unwrap();
        assert_eq!(partial.candidate.title.as_deref(), Some("Something"));
        assert_eq!(partial.unresolved, vec!["date", "time"]);
    }

    #[tokio::test]
    async fn test_malformed_reply() {
        let extractor = Extractor::new(ScriptedGenerator::new("I am not sure what you mean."));
        assert!(matches!(
            extractor.extract("hmm", reference(), Tz::UTC).await,
            Err(ExtractionError::MalformedResponse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_typed() {
        let generator = ScriptedGenerator::slow(r#"{"title": "Late"}"#, Duration::from_secs(60));
        let extractor = Extractor::new(generator).with_timeout(Duration::from_secs(5));

        assert!(matches!(
            extractor.extract("late", reference(), Tz::UTC).await,
            Err(ExtractionError::Timeout(_))
        ));

        let extractor = Extractor::new(ScriptedGenerator::failing(appt_core::Error::Timeout));
        assert!(matches!(
            extractor.extract("late", reference(), Tz::UTC).await,
            Err(ExtractionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_error_is_generation_error() {
        let generator = ScriptedGenerator::failing(appt_core::Error::Llm("503".to_string()));
        let extractor = Extractor::new(generator);
        assert!(matches!(
            extractor.extract("x", reference(), Tz::UTC).await,
            Err(ExtractionError::Generation(_))
        ));
    }

    #[test]
    fn test_parse_end_forms() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        assert_eq!(
            parse_end("2025-03-14T11:00", day),
            day.and_hms_opt(11, 0, 0)
        );
        assert_eq!(parse_end("4:30pm", day), day.and_hms_opt(16, 30, 0));
        assert_eq!(parse_end("soon", day), None);
    }
}
