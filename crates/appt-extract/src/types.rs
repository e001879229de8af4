//! Extraction output types

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Default appointment length when none is stated
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

/// Partially-filled appointment as read from free text.
///
/// Dates and times are wall-clock values in the user's timezone; they are
/// resolved to instants by [`crate::normalize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppointmentCandidate {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    /// Explicit local end, when the text states one
    pub end: Option<NaiveDateTime>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub partner_relevant: bool,
}

impl AppointmentCandidate {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_time(mut self, time: NaiveTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    pub fn with_end(mut self, end: NaiveDateTime) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_partner_relevant(mut self, partner_relevant: bool) -> Self {
        self.partner_relevant = partner_relevant;
        self
    }

    /// Names of required fields that are still empty
    pub fn unresolved(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.title.as_deref().map(str::trim).unwrap_or("").is_empty() {
            missing.push("title".to_string());
        }
        if self.date.is_none() {
            missing.push("date".to_string());
        }
        if self.time.is_none() {
            missing.push("time".to_string());
        }
        missing
    }
}

/// Outcome of one extraction call. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub raw_text: String,
    pub candidate: AppointmentCandidate,
    /// In `[0, 1]`
    pub confidence: f32,
    pub unresolved: Vec<String>,
}

impl ExtractionResult {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_lists_missing_required_fields() {
        let candidate = AppointmentCandidate::new("   ");
        assert_eq!(candidate.unresolved(), vec!["title", "date", "time"]);

        let candidate = AppointmentCandidate::new("Lunch")
            .with_date(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())
            .with_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        assert!(candidate.unresolved().is_empty());
    }
}
