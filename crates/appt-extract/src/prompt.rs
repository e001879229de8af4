//! Instruction sent to the generation backend

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Build the system instruction for one extraction call.
///
/// The reference instant and timezone are spelled out so the backend can
/// resolve relative phrases itself; its answer is still re-checked locally.
pub fn system_prompt(reference_instant: DateTime<Utc>, timezone: Tz, default_duration: u32) -> String {
    let local = reference_instant.with_timezone(&timezone);
    format!(
        r#"You extract a single calendar appointment from the user's message.

Current local date and time: {local} ({weekday})
User timezone: {tz}

Reply with exactly one JSON object and nothing else:
{{
  "title": string,              // short summary of the appointment
  "date": "YYYY-MM-DD" | null,  // resolve words like "tomorrow" against the current date
  "time": "HH:MM" | null,       // 24-hour local time
  "duration_minutes": number,   // {default_duration} when not stated
  "end": "YYYY-MM-DDTHH:MM" | null, // only when an end time is stated
  "description": string | null,
  "location": string | null,
  "tags": [string],
  "partner_relevant": boolean,  // true when the partner should see it
  "confidence": number          // 0.0 to 1.0
}}

Use null for anything the message does not state. Do not invent dates or times."#,
        local = local.format("%Y-%m-%d %H:%M"),
        weekday = local.format("%A"),
        tz = timezone.name(),
        default_duration = default_duration,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_prompt_uses_local_reference() {
        let instant = Utc.with_ymd_and_hms(2025, 3, 12, 23, 30, 0).unwrap();
        let prompt = system_prompt(instant, chrono_tz::Asia::Tokyo, 60);

        assert!(prompt.contains("2025-03-13 08:30 (Thursday)"));
        assert!(prompt.contains("Asia/Tokyo"));
        assert!(prompt.contains("\"duration_minutes\": number,   // 60 when not stated"));
    }
}
