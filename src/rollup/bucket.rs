use chrono::NaiveDate;
use serde::Serialize;

use crate::date_util::iso_year_week;

/// The time span a rollup row summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeBucket {
    Day(NaiveDate),
    /// ISO year and ISO week number.
    Week(i32, u32),
    Month(i32, u32),
    AllTime,
}

/// Display/styling category of a rollup row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Daily,
    WeekSummary,
    MonthSummary,
    Total,
}

impl TimeBucket {
    pub fn week_of(d: NaiveDate) -> Self {
        let (y, w) = iso_year_week(d);
        TimeBucket::Week(y, w)
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            TimeBucket::Day(_) => BucketKind::Daily,
            TimeBucket::Week(..) => BucketKind::WeekSummary,
            TimeBucket::Month(..) => BucketKind::MonthSummary,
            TimeBucket::AllTime => BucketKind::Total,
        }
    }

    /// Canonical key string, e.g. `2025-06-30`, `2025-W27`, `2025-06`, `all`.
    pub fn to_key(&self) -> String {
        match self {
            TimeBucket::Day(d) => d.format("%Y-%m-%d").to_string(),
            TimeBucket::Week(y, w) => format!("{y}-W{w:02}"),
            TimeBucket::Month(y, m) => format!("{y}-{m:02}"),
            TimeBucket::AllTime => "all".to_string(),
        }
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
