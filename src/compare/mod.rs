use std::collections::HashMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Serialize, Serializer};

use crate::aggregate::AggregatedRow;
use crate::error::Result;
use crate::metrics::{MetricRegistry, ACTIVE_SUB_ENTITIES, DAILY_ACTIVE, TOTAL_VOLUME};

/// Metrics tracked by default in a comparison, in display order.
pub const DEFAULT_COMPARE_METRICS: &[&str] = &[
    "Reg",
    "FTD",
    "FTT",
    "Net Deposit ($)",
    DAILY_ACTIVE,
    TOTAL_VOLUME,
    "Total Fee ($)",
    "Profit Fee ($)",
    ACTIVE_SUB_ENTITIES,
    "EFTTC",
    "Futures PNL",
];

/// Largest lookback accepted from configuration or the command line.
pub const MAX_LOOKBACK_DAYS: i64 = 3660;

#[derive(Debug, Clone)]
pub struct ComparisonOptions {
    /// How many days before the latest date may still provide a baseline.
    pub lookback_days: i64,
    pub metrics: Vec<String>,
    /// Groups are ranked by their current value of this metric, descending.
    pub sort_metric: String,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            lookback_days: 1,
            metrics: DEFAULT_COMPARE_METRICS.iter().map(|s| s.to_string()).collect(),
            sort_metric: TOTAL_VOLUME.to_string(),
        }
    }
}

/// Signed percentage change between two observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeRate {
    /// Previous was zero or absent and current is positive.
    FromZero,
    /// Exactly unchanged, or zero/absent to non-positive.
    Flat,
    /// Percentage change relative to the magnitude of the previous value.
    Delta(f64),
}

impl ChangeRate {
    pub fn between(current: f64, previous: Option<f64>) -> Self {
        match previous.filter(|p| *p != 0.0 && p.is_finite()) {
            None => {
                if current > 0.0 {
                    ChangeRate::FromZero
                } else {
                    ChangeRate::Flat
                }
            }
            Some(p) => {
                let delta = (current - p) / p.abs() * 100.0;
                if delta == 0.0 {
                    ChangeRate::Flat
                } else {
                    ChangeRate::Delta(delta)
                }
            }
        }
    }
}

impl fmt::Display for ChangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeRate::FromZero => write!(f, "+100%"),
            ChangeRate::Flat => write!(f, "0%"),
            ChangeRate::Delta(d) => write!(f, "{d:+.1}%"),
        }
    }
}

impl Serialize for ChangeRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricChange {
    pub metric: String,
    pub value: f64,
    pub change: ChangeRate,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupComparison {
    pub group: String,
    /// Date of the row used as "current".
    pub date: NaiveDate,
    pub previous_date: Option<NaiveDate>,
    pub metrics: Vec<MetricChange>,
}

impl GroupComparison {
    pub fn metric(&self, name: &str) -> Option<&MetricChange> {
        self.metrics.iter().find(|m| m.metric == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub latest: Option<NaiveDate>,
    pub cutoff: Option<NaiveDate>,
    pub groups: Vec<GroupComparison>,
}

/// Compare each group's latest row with the one before it.
///
/// `rows` hold one daily series per group (see
/// [`crate::aggregate::merge_by_top_level`]); the group name is the rendered
/// key. Unknown metric names fail before any work is done.
pub fn compare(
    rows: &[AggregatedRow],
    opts: &ComparisonOptions,
    registry: &MetricRegistry,
) -> Result<Comparison> {
    for metric in &opts.metrics {
        registry.require(metric)?;
    }
    registry.require(&opts.sort_metric)?;

    let Some(latest) = rows.iter().map(|r| r.date).max() else {
        return Ok(Comparison {
            latest: None,
            cutoff: None,
            groups: Vec::new(),
        });
    };
    let cutoff = lookback_cutoff(latest, opts.lookback_days);

    // Groups in first-appearance order, so equal sort values keep input order.
    let mut groups: Vec<(String, Vec<&AggregatedRow>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows.iter().filter(|r| r.date >= cutoff) {
        let name = row.key.to_string();
        match index.get(&name) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(name.clone(), groups.len());
                groups.push((name, vec![row]));
            }
        }
    }

    let mut out: Vec<GroupComparison> = groups
        .into_iter()
        .map(|(group, mut members)| {
            members.sort_by(|a, b| b.date.cmp(&a.date));
            let current = members[0];
            let previous = members.iter().skip(1).find(|r| r.date < current.date);
            let metrics = opts
                .metrics
                .iter()
                .map(|m| {
                    let value = current.values.value(m);
                    MetricChange {
                        metric: m.clone(),
                        value,
                        change: ChangeRate::between(value, previous.map(|p| p.values.value(m))),
                    }
                })
                .collect();
            GroupComparison {
                group,
                date: current.date,
                previous_date: previous.map(|p| p.date),
                metrics,
            }
        })
        .collect();

    let sort_value = |g: &GroupComparison| {
        g.metrics
            .iter()
            .find(|m| m.metric == opts.sort_metric)
            .map(|m| m.value)
            .unwrap_or(0.0)
    };
    out.sort_by(|a, b| sort_value(b).total_cmp(&sort_value(a)));

    log::debug!("Compared groups from {cutoff} to {latest}");
    Ok(Comparison {
        latest: Some(latest),
        cutoff: Some(cutoff),
        groups: out,
    })
}

/// Earliest date still inside the window. A window reaching past the
/// calendar range has no cutoff.
fn lookback_cutoff(latest: NaiveDate, lookback_days: i64) -> NaiveDate {
    Duration::try_days(lookback_days.max(0))
        .and_then(|span| latest.checked_sub_signed(span))
        .unwrap_or(NaiveDate::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKey;
    use crate::error::Error;
    use crate::metrics::MetricValues;
    use std::collections::BTreeSet;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn row(group: &str, date: NaiveDate, reg: f64, vol: f64) -> AggregatedRow {
        let values: MetricValues = [
            ("Reg".to_string(), reg),
            ("Spot Vol ($)".to_string(), vol),
        ]
        .into_iter()
        .collect();
        AggregatedRow {
            key: DimensionKey::from_segments(vec![group.to_string()]),
            sub_entity: None,
            date,
            values: MetricRegistry::standard().finish(values),
            members: BTreeSet::new(),
        }
    }

    #[test]
    fn test_change_rate_rendering() {
        assert_eq!(ChangeRate::between(100.0, Some(0.0)).to_string(), "+100%");
        assert_eq!(ChangeRate::between(0.0, Some(0.0)).to_string(), "0%");
        assert_eq!(ChangeRate::between(-5.0, Some(0.0)).to_string(), "0%");
        assert_eq!(ChangeRate::between(50.0, Some(100.0)).to_string(), "-50.0%");
        assert_eq!(ChangeRate::between(150.0, Some(100.0)).to_string(), "+50.0%");
        assert_eq!(ChangeRate::between(42.0, Some(42.0)).to_string(), "0%");
        assert_eq!(ChangeRate::between(-50.0, Some(-100.0)).to_string(), "+50.0%");
        assert_eq!(ChangeRate::between(7.0, None).to_string(), "+100%");
        assert_eq!(ChangeRate::between(0.0, None).to_string(), "0%");
        assert_eq!(ChangeRate::between(3.0, Some(f64::NAN)).to_string(), "+100%");
    }

    #[test]
    fn test_compare_ranks_by_sort_metric() {
        let reg = MetricRegistry::standard();
        let rows = vec![
            row("Alice", d(2025, 6, 1), 10.0, 100.0),
            row("Alice", d(2025, 6, 2), 15.0, 100.0),
            row("Bob", d(2025, 6, 1), 4.0, 50.0),
            row("Bob", d(2025, 6, 2), 2.0, 500.0),
        ];
        let cmp = compare(&rows, &ComparisonOptions::default(), &reg).unwrap();
        assert_eq!(cmp.latest, Some(d(2025, 6, 2)));
        assert_eq!(cmp.cutoff, Some(d(2025, 6, 1)));

        let names: Vec<&str> = cmp.groups.iter().map(|g| g.group.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Alice"]);

        let bob = &cmp.groups[0];
        assert_eq!(bob.previous_date, Some(d(2025, 6, 1)));
        assert_eq!(bob.metric("Reg").unwrap().change.to_string(), "-50.0%");
        assert_eq!(bob.metric(TOTAL_VOLUME).unwrap().value, 500.0);
        assert_eq!(bob.metric(TOTAL_VOLUME).unwrap().change.to_string(), "+900.0%");

        let alice = &cmp.groups[1];
        assert_eq!(alice.metric("Reg").unwrap().change.to_string(), "+50.0%");
        assert_eq!(alice.metric(TOTAL_VOLUME).unwrap().change, ChangeRate::Flat);
        assert_eq!(alice.metrics.len(), DEFAULT_COMPARE_METRICS.len());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let reg = MetricRegistry::standard();
        let rows = vec![
            row("Zed", d(2025, 6, 2), 1.0, 10.0),
            row("Amy", d(2025, 6, 2), 1.0, 10.0),
            row("Max", d(2025, 6, 2), 1.0, 20.0),
        ];
        let cmp = compare(&rows, &ComparisonOptions::default(), &reg).unwrap();
        let names: Vec<&str> = cmp.groups.iter().map(|g| g.group.as_str()).collect();
        assert_eq!(names, vec!["Max", "Zed", "Amy"]);
    }

    #[test]
    fn test_rows_outside_lookback_are_ignored() {
        let reg = MetricRegistry::standard();
        let rows = vec![
            row("Alice", d(2025, 6, 1), 10.0, 0.0),
            row("Alice", d(2025, 6, 5), 20.0, 0.0),
            row("Bob", d(2025, 6, 4), 3.0, 0.0),
            row("Bob", d(2025, 6, 5), 6.0, 0.0),
        ];
        let cmp = compare(&rows, &ComparisonOptions::default(), &reg).unwrap();
        let alice = cmp.groups.iter().find(|g| g.group == "Alice").unwrap();
        assert_eq!(alice.previous_date, None);
        assert_eq!(alice.metric("Reg").unwrap().change, ChangeRate::FromZero);
        assert_eq!(alice.metric("FTD").unwrap().change, ChangeRate::Flat);

        let bob = cmp.groups.iter().find(|g| g.group == "Bob").unwrap();
        assert_eq!(bob.metric("Reg").unwrap().change.to_string(), "+100.0%");

        let wide = ComparisonOptions {
            lookback_days: 7,
            ..Default::default()
        };
        let cmp = compare(&rows, &wide, &reg).unwrap();
        let alice = cmp.groups.iter().find(|g| g.group == "Alice").unwrap();
        assert_eq!(alice.previous_date, Some(d(2025, 6, 1)));
        assert_eq!(alice.metric("Reg").unwrap().change.to_string(), "+100.0%");
    }

    #[test]
    fn test_huge_lookback_means_no_cutoff() {
        let reg = MetricRegistry::standard();
        let rows = vec![
            row("Alice", d(2025, 5, 1), 4.0, 0.0),
            row("Alice", d(2025, 6, 2), 5.0, 0.0),
        ];
        for days in [400_000_000, i64::MAX] {
            let opts = ComparisonOptions {
                lookback_days: days,
                ..Default::default()
            };
            let cmp = compare(&rows, &opts, &reg).unwrap();
            assert_eq!(cmp.cutoff, Some(NaiveDate::MIN));
            assert_eq!(cmp.groups[0].previous_date, Some(d(2025, 5, 1)));
            assert_eq!(cmp.groups[0].metric("Reg").unwrap().change.to_string(), "+25.0%");
        }
    }

    #[test]
    fn test_many_groups_keep_first_appearance_order() {
        let reg = MetricRegistry::standard();
        let rows: Vec<AggregatedRow> = (0..50)
            .flat_map(|i| {
                let name = format!("G{i:02}");
                [row(&name, d(2025, 6, 1), 1.0, 5.0), row(&name, d(2025, 6, 2), 1.0, 5.0)]
            })
            .collect();
        let cmp = compare(&rows, &ComparisonOptions::default(), &reg).unwrap();
        assert_eq!(cmp.groups.len(), 50);
        assert_eq!(cmp.groups[0].group, "G00");
        assert_eq!(cmp.groups[49].group, "G49");
        assert!(cmp.groups.iter().all(|g| g.previous_date == Some(d(2025, 6, 1))));
    }

    #[test]
    fn test_unknown_metric_is_rejected() {
        let reg = MetricRegistry::standard();
        let opts = ComparisonOptions {
            sort_metric: "Volume".into(),
            ..Default::default()
        };
        assert!(matches!(
            compare(&[], &opts, &reg),
            Err(Error::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_empty_input() {
        let reg = MetricRegistry::standard();
        let cmp = compare(&[], &ComparisonOptions::default(), &reg).unwrap();
        assert!(cmp.groups.is_empty());
        assert_eq!(cmp.latest, None);
    }
}
