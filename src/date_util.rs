use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

static RE_SEPARATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})(?:[ T].*)?$").unwrap()
});
static RE_COMPACT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Number of calendar days in a given month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    last_day_of_month(year, month).day()
}

/// ISO-8601 (year, week) for a date. The ISO year differs from the calendar
/// year for days at the edges of the year.
pub fn iso_year_week(d: NaiveDate) -> (i32, u32) {
    let iw = d.iso_week();
    (iw.year(), iw.week())
}

/// Parse a date as it appears in source exports.
///
/// Supported formats:
/// - `2025-06-30`, `2025/6/30`, `2025.06.30`, optionally followed by a time
/// - `20250630`
///
/// Returns `None` for anything else, including impossible calendar dates.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let caps = RE_SEPARATED
        .captures(s)
        .or_else(|| RE_COMPACT.captures(s))?;
    let year: i32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
