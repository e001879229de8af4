//! Relative and loosely formatted date/time phrases
//!
//! Dates resolve against a reference date in the user's timezone:
//! - `today`, `tonight`, `tomorrow`, `day after tomorrow`, `yesterday`
//! - weekday names, optionally prefixed by `this` or `next`
//! - `in N days`, `in N weeks`
//! - `2025-03-14`, `14.03.2025`, `03/14/2025`
//!
//! Times: `15:30`, `3pm`, `3:30 pm`, `noon`, `midnight`.

use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use regex::Regex;

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("Invalid regex"));
static DOTTED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").expect("Invalid regex"));
static SLASHED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("Invalid regex"));
static IN_N_UNITS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bin\s+(\d{1,3})\s+(day|days|week|weeks)\b").expect("Invalid regex")
});
static WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(this|next)\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)\b",
    )
    .expect("Invalid regex")
});
static RELATIVE_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(day\s+after\s+tomorrow|today|tonight|tomorrow|yesterday)\b")
        .expect("Invalid regex")
});

static TIME_12H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::([0-5]\d))?\s*(am\b|pm\b|a\.m\.|p\.m\.)").expect("Invalid regex")
});
static TIME_24H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)(?::([0-5]\d))?\b").expect("Invalid regex")
});
static NAMED_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(noon|midday|midnight)\b").expect("Invalid regex"));

/// Resolve the first date phrase found in `text`
pub fn resolve_date(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    if let Some(date) = absolute_date(text) {
        return Some(date);
    }

    if let Some(cap) = RELATIVE_DAY.captures(text) {
        let phrase = cap[1].to_lowercase();
        let days = match phrase.as_str() {
            "today" | "tonight" => 0,
            "tomorrow" => 1,
            "yesterday" => -1,
            _ => 2,
        };
        return Some(reference + Duration::days(days));
    }

    if let Some(cap) = IN_N_UNITS.captures(text) {
        let n: i64 = cap[1].parse().ok()?;
        let unit = cap[2].to_lowercase();
        return Some(if unit.starts_with("week") {
            reference + Duration::weeks(n)
        } else {
            reference + Duration::days(n)
        });
    }

    if let Some(cap) = WEEKDAY.captures(text) {
        let skip_this_week = cap
            .get(1)
            .is_some_and(|m| m.as_str().eq_ignore_ascii_case("next"));
        let weekday = parse_weekday(&cap[2])?;
        return Some(next_weekday(reference, weekday, skip_this_week));
    }

    None
}

/// Resolve the first time-of-day phrase found in `text`
pub fn resolve_time(text: &str) -> Option<NaiveTime> {
    if let Some(cap) = TIME_12H.captures(text) {
        let mut hour: u32 = cap[1].parse().ok()?;
        let minute: u32 = cap.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        if !(1..=12).contains(&hour) {
            return None;
        }
        let period = cap[3].to_lowercase();
        if period.starts_with('p') && hour != 12 {
            hour += 12;
        } else if period.starts_with('a') && hour == 12 {
            hour = 0;
        }
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(cap) = TIME_24H.captures(text) {
        let hour: u32 = cap[1].parse().ok()?;
        let minute: u32 = cap[2].parse().ok()?;
        let second: u32 = cap.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
        return NaiveTime::from_hms_opt(hour, minute, second);
    }

    if let Some(cap) = NAMED_TIME.captures(text) {
        return match cap[1].to_lowercase().as_str() {
            "midnight" => NaiveTime::from_hms_opt(0, 0, 0),
            _ => NaiveTime::from_hms_opt(12, 0, 0),
        };
    }

    None
}

fn absolute_date(text: &str) -> Option<NaiveDate> {
    if let Some(cap) = ISO_DATE.captures(text) {
        return ymd(&cap[1], &cap[2], &cap[3]);
    }
    if let Some(cap) = DOTTED_DATE.captures(text) {
        return ymd(&cap[3], &cap[2], &cap[1]);
    }
    if let Some(cap) = SLASHED_DATE.captures(text) {
        return ymd(&cap[3], &cap[1], &cap[2]);
    }
    None
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    let lower = name.to_lowercase();
    let weekday = match lower.get(..3)? {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(weekday)
}

/// Next occurrence of `target` on or after `reference`; `next X` skips a week
fn next_weekday(reference: NaiveDate, target: Weekday, skip_this_week: bool) -> NaiveDate {
    let current = reference.weekday().num_days_from_monday() as i64;
    let target = target.num_days_from_monday() as i64;
    let mut days_ahead = (target - current).rem_euclid(7);
    if skip_this_week {
        days_ahead += 7;
    }
    reference + Duration::days(days_ahead)
}
