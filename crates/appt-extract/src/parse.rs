//! Tolerant parsing of generation replies
//!
//! Backends wrap the requested object in prose or code fences, or keep
//! talking after it. The parser takes the first well-formed object and
//! ignores everything else.

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use crate::error::{ExtractionError, Result};

/// Fields the instruction asks for, all optional on the way in.
///
/// Every field is read through a JSON value and coerced, so a wrongly typed
/// field degrades to `None` instead of rejecting the whole reply.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawReply {
    #[serde(deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub date: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub time: Option<String>,
    #[serde(alias = "duration")]
    pub duration_minutes: Option<JsonValue>,
    #[serde(deserialize_with = "lenient_text")]
    pub end: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient_tags")]
    pub tags: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient_bool")]
    pub partner_relevant: Option<bool>,
    pub confidence: Option<JsonValue>,
}

impl RawReply {
    /// Duration in minutes, accepting numbers or numeric strings
    pub fn duration(&self) -> Option<u32> {
        self.duration_minutes.as_ref().and_then(as_f64).and_then(|m| {
            (m.is_finite() && m > 0.0 && m <= u32::MAX as f64).then(|| m.round() as u32)
        })
    }

    /// Confidence clamped to `[0, 1]`; percentages are scaled down
    pub fn confidence(&self) -> Option<f32> {
        let value = self.confidence.as_ref().and_then(as_f64)?;
        if !value.is_finite() {
            return None;
        }
        let value = if value > 1.0 && value <= 100.0 {
            value / 100.0
        } else {
            value
        };
        Some(value.clamp(0.0, 1.0) as f32)
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(as_text(&JsonValue::deserialize(deserializer)?))
}

fn lenient_tags<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Vec<String>>, D::Error> {
    let tags = match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items.iter().filter_map(as_text).collect(),
        JsonValue::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        other => match as_text(&other) {
            Some(tag) => vec![tag],
            None => return Ok(None),
        },
    };
    Ok(Some(tags))
}

fn lenient_bool<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<bool>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Bool(b) => Some(b),
        JsonValue::Number(n) => n.as_f64().map(|n| n != 0.0),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Scalars as text; objects by their `name`, `title` or `address` member
fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Object(map) => ["name", "title", "address"]
            .iter()
            .find_map(|key| map.get(*key).and_then(as_text)),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(as_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        JsonValue::Null => None,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Parse a generation reply into its structured fields
pub fn parse_reply(reply: &str) -> Result<RawReply> {
    let object = locate_object(reply).ok_or_else(|| {
        ExtractionError::MalformedResponse(format!(
            "no structured object in reply: {}",
            preview(reply)
        ))
    })?;

    serde_json::from_str(object).map_err(|e| {
        ExtractionError::MalformedResponse(format!("{}: {}", e, preview(object)))
    })
}

/// The JSON object the reply carries.
///
/// A fenced block wins over bare text; within the chosen text the first
/// balanced top-level object is returned and anything after it is dropped.
pub fn locate_object(reply: &str) -> Option<&str> {
    fenced_blocks(reply)
        .into_iter()
        .find_map(first_balanced_object)
        .or_else(|| first_balanced_object(reply))
}

/// Bodies of ``` fenced blocks, in order
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the info string ("json", "JSON", ...)
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// First `{ ... }` whose braces balance, ignoring braces inside strings
fn first_balanced_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            let candidate = &text[start..start + end];
            if serde_json::from_str::<serde_json::Map<String, JsonValue>>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the object starting at `text[0] == '{'`, if it closes
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_prose_is_discarded() {
        let reply = "Sure! {\"title\":\"Meeting\"} Let me know if you need anything else!";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Meeting"));
        assert_eq!(parsed.date, None);
    }

    #[test]
    fn test_fenced_block_preferred() {
        let reply = "Example: {\"title\":\"Wrong\"}\n```json\n{\"title\": \"Right\", \"time\": \"14:00\"}\n```\nDone.";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Right"));
        assert_eq!(parsed.time.as_deref(), Some("14:00"));
    }

    #[test]
    fn test_braces_inside_strings() {
        let reply = r#"{"title": "Fix } bug {", "description": "say \"hi\" }"} {"title": "second"}"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Fix } bug {"));
        assert_eq!(parsed.description.as_deref(), Some("say \"hi\" }"));
    }

    #[test]
    fn test_nested_object_is_kept_whole() {
        let reply = r#"Result: {"title": "Trip", "meta": {"a": 1}} trailing }"#;
        assert_eq!(
            locate_object(reply),
            Some(r#"{"title": "Trip", "meta": {"a": 1}}"#)
        );
    }

    #[test]
    fn test_no_object_is_malformed() {
        for reply in ["I could not find an appointment.", "{\"title\": \"open", "}{", ""] {
            assert!(matches!(
                parse_reply(reply),
                Err(ExtractionError::MalformedResponse(_))
            ));
        }
    }

    #[test]
    fn test_unbalanced_prefix_does_not_hide_later_object() {
        let reply = r#"{ oops, here it is: {"title": "Call mom"}"#;
        assert_eq!(parse_reply(reply).unwrap().title.as_deref(), Some("Call mom"));
    }

    #[test]
    fn test_numeric_fields_are_lenient() {
        let reply = r#"{"title": "Run", "duration_minutes": "45", "confidence": "85%"}"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.duration(), Some(45));
        assert_eq!(parsed.confidence(), Some(0.85));

        let reply = r#"{"title": "Run", "duration": 30.0, "confidence": 3}"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.duration(), Some(30));
        assert_eq!(parsed.confidence(), Some(0.03));

        let reply = r#"{"title":"Standup","date":"2025-03-14","time":"09:00","tags":"work"}"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.tags, Some(vec!["work".to_string()]));
        assert_eq!(parsed.time.as_deref(), Some("09:00"));
    }

    #[test]
    fn test_mistyped_fields_are_coerced() {
        let reply = r#"{
            "title": 1984,
            "partner_relevant": "yes",
            "location": {"name": "Room 1", "floor": 2},
            "tags": ["work", 7, null],
            "description": null
        }"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("1984"));
        assert_eq!(parsed.partner_relevant, Some(true));
        assert_eq!(parsed.location.as_deref(), Some("Room 1"));
        assert_eq!(parsed.tags, Some(vec!["work".to_string(), "7".to_string()]));
        assert_eq!(parsed.description, None);

        let reply = r#"{"title": "Gym", "partner_relevant": "maybe", "end": 17}"#;
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.partner_relevant, None);
        assert_eq!(parsed.end.as_deref(), Some("17"));
    }
}
