//! iCalendar (RFC 5545) encoding of appointments
//!
//! Tracking fields travel as `X-APPT-*` properties so they survive a round
//! trip through any CalDAV server.

use appt_core::{Appointment, SyncState, TrackingFields};
use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, StoreError};

const PROP_PARTNER_RELEVANT: &str = "X-APPT-PARTNER-RELEVANT";
const PROP_SYNCED_PEER_ID: &str = "X-APPT-SYNCED-PEER-ID";
const PROP_SOURCE_USER_ID: &str = "X-APPT-SOURCE-USER-ID";
const PROP_SOURCE_PRIVATE_ID: &str = "X-APPT-SOURCE-PRIVATE-ID";
const PROP_SYNC_STATE: &str = "X-APPT-SYNC-STATE";
/// Original UTC offset in seconds, so DTSTART can be written in UTC
const PROP_UTC_OFFSET: &str = "X-APPT-UTC-OFFSET";

const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const LOCAL_FORMAT: &str = "%Y%m%dT%H%M%S";
const DATE_FORMAT: &str = "%Y%m%d";

/// Content lines longer than this are folded
const FOLD_WIDTH: usize = 75;

/// Serialize `record` as a VCALENDAR holding one VEVENT
pub fn to_ical(record: &Appointment, uid: &str) -> String {
    let mut ical = String::new();
    let mut line = |content: String| {
        fold_into(&mut ical, &content);
    };

    line("BEGIN:VCALENDAR".to_string());
    line("VERSION:2.0".to_string());
    line("PRODID:-//appt-gateway//calendar//EN".to_string());
    line("CALSCALE:GREGORIAN".to_string());
    line("BEGIN:VEVENT".to_string());

    line(format!("UID:{}", uid));
    line(format!("DTSTAMP:{}", Utc::now().format(UTC_FORMAT)));
    if let Some(created) = record.created_at {
        line(format!("CREATED:{}", created.format(UTC_FORMAT)));
    }
    line(format!(
        "DTSTART:{}",
        record.start.with_timezone(&Utc).format(UTC_FORMAT)
    ));
    line(format!(
        "DTEND:{}",
        record.end.with_timezone(&Utc).format(UTC_FORMAT)
    ));
    line(format!(
        "{}:{}",
        PROP_UTC_OFFSET,
        record.start.offset().local_minus_utc()
    ));
    line(format!("SUMMARY:{}", escape_text(&record.title)));

    if let Some(ref desc) = record.description {
        line(format!("DESCRIPTION:{}", escape_text(desc)));
    }
    if let Some(ref loc) = record.location {
        line(format!("LOCATION:{}", escape_text(loc)));
    }
    if !record.tags.is_empty() {
        let categories: Vec<String> = record.tags.iter().map(|t| escape_text(t)).collect();
        line(format!("CATEGORIES:{}", categories.join(",")));
    }

    if record.partner_relevant {
        line(format!("{}:TRUE", PROP_PARTNER_RELEVANT));
    }
    let tracking = &record.tracking;
    if let Some(ref peer) = tracking.synced_peer_id {
        line(format!("{}:{}", PROP_SYNCED_PEER_ID, escape_text(peer)));
    }
    if let Some(ref user) = tracking.source_user_id {
        line(format!("{}:{}", PROP_SOURCE_USER_ID, escape_text(user)));
    }
    if let Some(ref private_id) = tracking.source_private_id {
        line(format!("{}:{}", PROP_SOURCE_PRIVATE_ID, escape_text(private_id)));
    }
    line(format!("{}:{}", PROP_SYNC_STATE, tracking.sync_state.as_str()));

    line("END:VEVENT".to_string());
    line("END:VCALENDAR".to_string());
    ical
}

/// Parse the first VEVENT of an iCalendar document.
///
/// The returned record's `id` is the event UID.
pub fn parse_ical(ical: &str) -> Result<Appointment> {
    let mut uid = None;
    let mut title = None;
    let mut description = None;
    let mut location = None;
    let mut tags = Vec::new();
    let mut start = None;
    let mut end = None;
    let mut created_at = None;
    let mut utc_offset = None;
    let mut partner_relevant = false;
    let mut tracking = TrackingFields::default();

    let mut in_event = false;
    for line in unfold(ical) {
        let Some(property) = Property::parse(&line) else {
            continue;
        };

        match (property.name.as_str(), in_event) {
            ("BEGIN", _) if property.value.eq_ignore_ascii_case("VEVENT") => in_event = true,
            ("END", true) if property.value.eq_ignore_ascii_case("VEVENT") => break,
            (_, false) => {}
            ("UID", _) => uid = Some(property.value),
            ("SUMMARY", _) => title = Some(unescape_text(&property.value)),
            ("DESCRIPTION", _) => description = Some(unescape_text(&property.value)),
            ("LOCATION", _) => location = Some(unescape_text(&property.value)),
            ("CATEGORIES", _) => tags.extend(
                split_unescaped(&property.value, ',')
                    .into_iter()
                    .map(|t| unescape_text(t.trim()))
                    .filter(|t| !t.is_empty()),
            ),
            ("DTSTART", _) => start = Some(property.date_time()?),
            ("DTEND", _) => end = Some(property.date_time()?),
            ("CREATED", _) => {
                created_at = NaiveDateTime::parse_from_str(&property.value, UTC_FORMAT)
                    .ok()
                    .map(|dt| dt.and_utc())
            }
            (PROP_UTC_OFFSET, _) => utc_offset = property.value.trim().parse::<i32>().ok(),
            (PROP_PARTNER_RELEVANT, _) => {
                partner_relevant = property.value.trim().eq_ignore_ascii_case("TRUE")
            }
            (PROP_SYNCED_PEER_ID, _) => tracking.synced_peer_id = non_empty(&property.value),
            (PROP_SOURCE_USER_ID, _) => tracking.source_user_id = non_empty(&property.value),
            (PROP_SOURCE_PRIVATE_ID, _) => {
                tracking.source_private_id = non_empty(&property.value)
            }
            (PROP_SYNC_STATE, _) => {
                tracking.sync_state = property
                    .value
                    .parse::<SyncState>()
                    .map_err(StoreError::Marshalling)?
            }
            _ => {}
        }
    }

    let start = start.ok_or_else(|| StoreError::Marshalling("VEVENT without DTSTART".to_string()))?;
    let end = end.unwrap_or(start);

    let (start, end) = match utc_offset.and_then(FixedOffset::east_opt) {
        Some(offset) => (start.with_timezone(&offset), end.with_timezone(&offset)),
        None => (start, end),
    };

    Ok(Appointment {
        id: uid,
        title: title.unwrap_or_default(),
        start,
        end,
        description,
        location,
        tags,
        partner_relevant,
        origin: Default::default(),
        tracking,
        created_at,
    })
}

/// One content line split into name, parameters and value
struct Property {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl Property {
    fn parse(line: &str) -> Option<Self> {
        // The first colon outside a quoted parameter value ends the name part
        let mut in_quotes = false;
        let split = line.char_indices().find_map(|(i, c)| match c {
            '"' => {
                in_quotes = !in_quotes;
                None
            }
            ':' if !in_quotes => Some(i),
            _ => None,
        })?;

        let (head, value) = (&line[..split], &line[split + 1..]);
        let mut parts = split_unescaped(head, ';').into_iter();
        let name = parts.next()?.trim().to_ascii_uppercase();
        let params = parts
            .filter_map(|p| {
                let (key, val) = p.split_once('=')?;
                Some((key.trim().to_ascii_uppercase(), val.trim_matches('"').to_string()))
            })
            .collect();

        Some(Self {
            name,
            params,
            value: value.to_string(),
        })
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn date_time(&self) -> Result<DateTime<FixedOffset>> {
        let value = self.value.trim();
        let invalid = || StoreError::Marshalling(format!("invalid {} value '{}'", self.name, value));

        if self.param("VALUE") == Some("DATE") || !value.contains('T') {
            let date = NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| invalid())?;
            let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
            return Ok(midnight.and_utc().fixed_offset());
        }

        if let Some(utc) = value.strip_suffix('Z') {
            let naive = NaiveDateTime::parse_from_str(utc, LOCAL_FORMAT).map_err(|_| invalid())?;
            return Ok(naive.and_utc().fixed_offset());
        }

        let naive = NaiveDateTime::parse_from_str(value, LOCAL_FORMAT).map_err(|_| invalid())?;
        match self.param("TZID") {
            Some(tzid) => {
                let tz: Tz = tzid.parse().map_err(|_| {
                    StoreError::Marshalling(format!("unknown TZID '{}'", tzid))
                })?;
                match tz.from_local_datetime(&naive) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Ok(dt.fixed_offset()),
                    LocalResult::None => Err(invalid()),
                }
            }
            // Floating time, read as UTC
            None => Ok(naive.and_utc().fixed_offset()),
        }
    }
}

/// Join folded continuation lines
fn unfold(ical: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in ical.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match (raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')), lines.last_mut()) {
            (Some(rest), Some(last)) => last.push_str(rest),
            _ if raw.is_empty() => {}
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

/// Append `content` as one or more CRLF-terminated lines of at most 75 octets
fn fold_into(out: &mut String, content: &str) {
    let mut width = 0;
    for c in content.chars() {
        let len = c.len_utf8();
        if width + len > FOLD_WIDTH {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(c);
        width += len;
    }
    out.push_str("\r\n");
}

fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ';' => escaped.push_str("\\;"),
            ',' => escaped.push_str("\\,"),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split on `sep` unless it is backslash-escaped
fn split_unescaped(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut begin = 0;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            c if c == sep && !escaped => {
                parts.push(&value[begin..i]);
                begin = i + c.len_utf8();
            }
            _ => escaped = false,
        }
    }
    parts.push(&value[begin..]);
    parts
}

fn non_empty(value: &str) -> Option<String> {
    let value = unescape_text(value.trim());
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Appointment {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let mut appt = Appointment::new(
            "Dentist; check-up, annual",
            tz.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 3, 14, 9, 45, 0).unwrap(),
        )
        .with_description("Bring insurance card\nand forms")
        .with_location("Shibuya")
        .with_tags(vec!["health".to_string(), "a,b".to_string()])
        .with_partner_relevant(true);
        appt.tracking = TrackingFields::mirror_of("alice", "p-123");
        appt.tracking.sync_state = SyncState::Synced;
        appt
    }

    #[test]
    fn test_round_trip_keeps_content_and_tracking() {
        let appt = sample();
        let ical = to_ical(&appt, "uid-1");
        let parsed = parse_ical(&ical).unwrap();

        assert_eq!(parsed.id.as_deref(), Some("uid-1"));
        assert!(!parsed.content_differs(&appt));
        assert_eq!(parsed.start.offset().local_minus_utc(), 9 * 3600);
        assert!(parsed.partner_relevant);
        assert_eq!(parsed.tracking, appt.tracking);
    }

    #[test]
    fn test_long_lines_are_folded() {
        let appt = sample().with_description("x".repeat(200));
        let ical = to_ical(&appt, "uid-2");

        assert!(ical.split("\r\n").all(|l| l.len() <= FOLD_WIDTH));
        assert_eq!(parse_ical(&ical).unwrap().description, Some("x".repeat(200)));
    }

    #[test]
    fn test_parse_tzid_and_all_day() {
        let ical = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:abc\r\n\
                    DTSTART;TZID=Europe/Berlin:20250701T180000\r\n\
                    DTEND;TZID=Europe/Berlin:20250701T190000\r\n\
                    SUMMARY:Concert\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_ical(ical).unwrap();
        assert_eq!(parsed.start.offset().local_minus_utc(), 2 * 3600);
        assert_eq!(parsed.tracking, TrackingFields::default());
        assert!(!parsed.partner_relevant);

        let ical = "BEGIN:VEVENT\nDTSTART;VALUE=DATE:20250702\nSUMMARY:Holiday\nEND:VEVENT\n";
        let parsed = parse_ical(ical).unwrap();
        assert_eq!(
            parsed.start.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 0).unwrap()
        );
        assert_eq!(parsed.end, parsed.start);
    }

    #[test]
    fn test_missing_start_is_marshalling_error() {
        let ical = "BEGIN:VEVENT\r\nSUMMARY:No time\r\nEND:VEVENT\r\n";
        assert!(matches!(parse_ical(ical), Err(StoreError::Marshalling(_))));
    }

    #[test]
    fn test_escape_roundtrip_and_split() {
        let text = "a;b,c\\d\ne";
        assert_eq!(unescape_text(&escape_text(text)), text);
        assert_eq!(split_unescaped("one\\,two,three", ','), vec!["one\\,two", "three"]);
    }
}
