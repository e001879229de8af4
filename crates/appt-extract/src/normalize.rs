//! Normalization and validation of extracted candidates

use appt_core::Appointment;
use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::ValidationError;
use crate::types::{AppointmentCandidate, DEFAULT_DURATION_MINUTES};

/// Turn a candidate into a concrete appointment in `timezone`.
///
/// Start needs both date and time. End is the explicit end when given,
/// otherwise start plus the duration. Every instant keeps its UTC offset.
pub fn normalize(
    candidate: &AppointmentCandidate,
    timezone: Tz,
) -> Result<Appointment, ValidationError> {
    let title = collapse_whitespace(candidate.title.as_deref().unwrap_or(""));
    if title.is_empty() {
        return Err(ValidationError::MissingField("title"));
    }

    let date = candidate.date.ok_or(ValidationError::MissingField("date"))?;
    let time = candidate.time.ok_or(ValidationError::MissingField("time"))?;
    let start = localize(date.and_time(time), timezone)?;

    let end = match candidate.end {
        Some(explicit) => {
            let end = localize(explicit, timezone)?;
            if end <= start {
                return Err(ValidationError::InvalidRange {
                    start: start.to_rfc3339(),
                    end: end.to_rfc3339(),
                });
            }
            end
        }
        None => {
            let minutes = candidate.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES);
            if minutes == 0 {
                return Err(ValidationError::InvalidRange {
                    start: start.to_rfc3339(),
                    end: start.to_rfc3339(),
                });
            }
            // Across a DST change the end may carry a different offset
            (start + Duration::minutes(minutes as i64))
                .with_timezone(&timezone)
                .fixed_offset()
        }
    };

    debug!(title = %title, start = %start, end = %end, "Normalized candidate");

    let mut appointment = Appointment::new(title, start, end)
        .with_tags(clean_tags(&candidate.tags))
        .with_partner_relevant(candidate.partner_relevant);
    appointment.description = non_blank(candidate.description.as_deref());
    appointment.location = non_blank(candidate.location.as_deref());
    Ok(appointment)
}

/// Attach the zone offset to a wall-clock time.
///
/// Ambiguous times (autumn fall-back) take the earlier offset; times inside a
/// spring-forward gap do not exist.
fn localize(local: NaiveDateTime, timezone: Tz) -> Result<DateTime<FixedOffset>, ValidationError> {
    match timezone.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.fixed_offset()),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.fixed_offset()),
        LocalResult::None => Err(ValidationError::NonexistentLocalTime {
            local: local.to_string(),
            timezone: timezone.name().to_string(),
        }),
    }
}

/// Trim and collapse internal runs of whitespace to one space
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}

fn clean_tags(tags: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for tag in tags {
        let tag = collapse_whitespace(tag);
        if !tag.is_empty() && !cleaned.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            cleaned.push(tag);
        }
    }
    cleaned
}
