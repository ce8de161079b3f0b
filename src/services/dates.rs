// src/services/dates.rs

//! Fuzzy publication-date parsing for listing text.
//!
//! Tries a handful of common layouts anywhere in the input:
//! - ISO `2024-01-15` with an optional `HH:MM[:SS]` time
//! - US numeric `01/15/2024`
//! - `January 15, 2024` / `Jan. 15 2024`
//! - `15 January 2024`
//!
//! Anything unrecognized, or a match that is not a real calendar date,
//! yields `None`.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::{Captures, Regex};

const MONTHS: &str = "jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec";

#[derive(Clone, Copy)]
enum Layout {
    Iso,
    Us,
    MonthFirst,
    DayFirst,
}

static DATE_PATTERNS: LazyLock<Vec<(Regex, Layout)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(
                r"\b(\d{4})-(\d{1,2})-(\d{1,2})(?:[T ](\d{1,2}):(\d{2})(?::(\d{2}))?)?",
            )
            .unwrap(),
            Layout::Iso,
        ),
        (
            Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap(),
            Layout::Us,
        ),
        (
            Regex::new(&format!(
                r"(?i)\b({MONTHS})[a-z]*\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
            ))
            .unwrap(),
            Layout::MonthFirst,
        ),
        (
            Regex::new(&format!(
                r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})[a-z]*\.?,?\s+(\d{{4}})\b"
            ))
            .unwrap(),
            Layout::DayFirst,
        ),
    ]
});

/// Best-effort parse of a date embedded in free text.
pub fn parse_fuzzy_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    DATE_PATTERNS.iter().find_map(|(pattern, layout)| {
        let caps = pattern.captures(text)?;
        from_captures(&caps, *layout)
    })
}

fn from_captures(caps: &Captures<'_>, layout: Layout) -> Option<DateTime<Utc>> {
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let (year, month, day) = match layout {
        Layout::Iso => (num(1)? as i32, num(2)?, num(3)?),
        Layout::Us => (num(3)? as i32, num(1)?, num(2)?),
        Layout::MonthFirst => (num(3)? as i32, month_number(caps.get(1)?.as_str())?, num(2)?),
        Layout::DayFirst => (num(3)? as i32, month_number(caps.get(2)?.as_str())?, num(1)?),
    };

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = match layout {
        Layout::Iso if caps.get(4).is_some() => {
            NaiveTime::from_hms_opt(num(4)?, num(5)?, num(6).unwrap_or(0))?
        }
        _ => NaiveTime::MIN,
    };

    Some(date.and_time(time).and_utc())
}

fn month_number(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_lowercase();
    MONTHS
        .split('|')
        .position(|m| m == prefix)
        .map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike};

    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_iso_date() {
        assert_eq!(parse_fuzzy_date("2024-01-15"), Some(ymd(2024, 1, 15)));
    }

    #[test]
    fn test_iso_datetime() {
        let parsed = parse_fuzzy_date("2024-01-15T13:45:10Z").unwrap();
        assert_eq!((parsed.hour(), parsed.minute(), parsed.second()), (13, 45, 10));
    }

    #[test]
    fn test_us_numeric() {
        assert_eq!(parse_fuzzy_date("Posted 01/15/2024"), Some(ymd(2024, 1, 15)));
    }

    #[test]
    fn test_month_name_first() {
        assert_eq!(parse_fuzzy_date("January 15, 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_fuzzy_date("Issued: Sept. 3 2023"), Some(ymd(2023, 9, 3)));
    }

    #[test]
    fn test_day_first() {
        assert_eq!(parse_fuzzy_date("15 March 2024"), Some(ymd(2024, 3, 15)));
        assert_eq!(parse_fuzzy_date("1st Dec 2022"), Some(ymd(2022, 12, 1)));
    }

    #[test]
    fn test_invalid_calendar_date() {
        assert_eq!(parse_fuzzy_date("2024-02-30"), None);
        assert_eq!(parse_fuzzy_date("13/45/2024"), None);
    }

    #[test]
    fn test_garbage_is_none() {
        assert_eq!(parse_fuzzy_date(""), None);
        assert_eq!(parse_fuzzy_date("no date here"), None);
        assert_eq!(parse_fuzzy_date("Order No. 2222"), None);
    }

    #[test]
    fn test_date_inside_sentence() {
        let parsed = parse_fuzzy_date("News Release | Feb 20, 2025 | Commission").unwrap();
        assert_eq!((parsed.year(), parsed.month(), parsed.day()), (2025, 2, 20));
    }
}
