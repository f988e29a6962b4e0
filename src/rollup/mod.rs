pub mod bucket;

pub use bucket::{BucketKind, TimeBucket};

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::aggregate::AggregatedRow;
use crate::date_util::days_in_month;
use crate::metrics::{MetricRegistry, MetricValues};

pub const TOTAL_LABEL: &str = "TOTAL";

/// One line of a tiered report. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupRow {
    label: String,
    kind: BucketKind,
    bucket: TimeBucket,
    values: MetricValues,
}

impl RollupRow {
    fn new(bucket: TimeBucket, label: String, values: MetricValues) -> Self {
        Self {
            label,
            kind: bucket.kind(),
            bucket,
            values,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    pub fn values(&self) -> &MetricValues {
        &self.values
    }
}

/// A month counts as complete when it has at least as many distinct
/// day-of-month values as the calendar has days. Neither contiguity nor
/// whether the month has already ended is checked.
pub fn is_month_complete(rows: &[&AggregatedRow], year: i32, month: u32) -> bool {
    let distinct_days: BTreeSet<u32> = rows.iter().map(|r| r.date.day()).collect();
    distinct_days.len() as u32 >= days_in_month(year, month)
}

/// Bucket one series of daily rows into a report, newest first:
///
/// 1. the most recent month: every day, a subtotal after each ISO week, and a
///    month subtotal;
/// 2. earlier months: a month subtotal if the month is complete, nothing
///    otherwise;
/// 3. a grand total over every row.
///
/// Week subtotals cover the whole ISO week as far as the series has data, so
/// a week that started in the previous month includes those days too.
pub fn build_rollup(rows: &[AggregatedRow], registry: &MetricRegistry) -> Vec<RollupRow> {
    if rows.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<&AggregatedRow> = rows.iter().collect();
    sorted.sort_by(|a, b| b.date.cmp(&a.date));

    let mut months: Vec<((i32, u32), Vec<&AggregatedRow>)> = Vec::new();
    for &row in &sorted {
        let ym = (row.date.year(), row.date.month());
        match months.last_mut() {
            Some((current, members)) if *current == ym => members.push(row),
            _ => months.push((ym, vec![row])),
        }
    }

    let mut out = Vec::new();
    for (idx, ((year, month), month_rows)) in months.iter().enumerate() {
        if idx == 0 {
            emit_current_month(&mut out, month_rows, &sorted, registry);
        } else if !is_month_complete(month_rows, *year, *month) {
            log::debug!(
                "Skipping incomplete month {year}-{month:02} ({} days present)",
                month_rows.len()
            );
            continue;
        }
        out.push(month_row(*year, *month, month_rows, registry));
    }

    out.push(RollupRow::new(
        TimeBucket::AllTime,
        TOTAL_LABEL.to_string(),
        registry.reduce_rows(&sorted),
    ));
    out
}

fn emit_current_month(
    out: &mut Vec<RollupRow>,
    month_rows: &[&AggregatedRow],
    all_rows: &[&AggregatedRow],
    registry: &MetricRegistry,
) {
    let mut i = 0;
    while i < month_rows.len() {
        let week = TimeBucket::week_of(month_rows[i].date);
        // Rows are sorted, so one week's days are adjacent.
        while i < month_rows.len() && TimeBucket::week_of(month_rows[i].date) == week {
            let row = month_rows[i];
            out.push(RollupRow::new(
                TimeBucket::Day(row.date),
                row.date.format("%Y-%m-%d").to_string(),
                registry.finish(row.values.clone()),
            ));
            i += 1;
        }

        let week_rows: Vec<&AggregatedRow> = all_rows
            .iter()
            .filter(|r| TimeBucket::week_of(r.date) == week)
            .copied()
            .collect();
        out.push(RollupRow::new(
            week,
            week_label(&week_rows),
            registry.reduce_rows(&week_rows),
        ));
    }
}

fn month_row(year: i32, month: u32, rows: &[&AggregatedRow], registry: &MetricRegistry) -> RollupRow {
    RollupRow::new(
        TimeBucket::Month(year, month),
        format!("{year}/{month:02}"),
        registry.reduce_rows(rows),
    )
}

/// `MM/DD~MM/DD` spanning the first and last day with data.
fn week_label(rows: &[&AggregatedRow]) -> String {
    let dates = rows.iter().map(|r| r.date);
    let start: Option<NaiveDate> = dates.clone().min();
    let end: Option<NaiveDate> = dates.max();
    match (start, end) {
        (Some(s), Some(e)) => format!("{}~{}", s.format("%m/%d"), e.format("%m/%d")),
        _ => String::new(),
    }
}
