use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::dimension::{DimensionKey, TaggedRecord};
use crate::metrics::{AggregateFn, MetricRegistry, MetricValues};

/// Granularity at which records are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// One row per (dimension, date).
    Dimension,
    /// One row per (sub-entity, dimension, date). Records without a
    /// sub-entity are left out and distinct counts are zero.
    SubEntity,
}

impl Grouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Dimension => "dimension",
            Grouping::SubEntity => "sub_entity",
        }
    }
}

/// One reduced row per group and date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRow {
    pub key: DimensionKey,
    pub sub_entity: Option<String>,
    pub date: NaiveDate,
    pub values: MetricValues,
    /// Sub-entity identifiers seen on this date; the basis of distinct counts.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub members: BTreeSet<String>,
}

type GroupKey = (Option<String>, DimensionKey, NaiveDate);

/// Reduce tagged records per `grouping`.
///
/// Rows come back ordered by (sub-entity, dimension, date), independent of
/// input order.
pub fn aggregate(
    records: &[TaggedRecord],
    grouping: Grouping,
    registry: &MetricRegistry,
) -> Vec<AggregatedRow> {
    let mut groups: BTreeMap<GroupKey, Vec<&TaggedRecord>> = BTreeMap::new();
    for record in records {
        let sub = match grouping {
            Grouping::Dimension => None,
            Grouping::SubEntity => match &record.sub_entity {
                Some(s) => Some(s.clone()),
                None => continue,
            },
        };
        groups
            .entry((sub, record.key.clone(), record.date))
            .or_default()
            .push(record);
    }

    let rows: Vec<AggregatedRow> = groups
        .into_iter()
        .map(|((sub_entity, key, date), group)| {
            let members: BTreeSet<String> = match grouping {
                Grouping::Dimension => group
                    .iter()
                    .filter_map(|r| r.sub_entity.clone())
                    .collect(),
                Grouping::SubEntity => BTreeSet::new(),
            };
            let values = reduce_day(&group, &members, registry);
            AggregatedRow {
                key,
                sub_entity,
                date,
                values,
                members,
            }
        })
        .collect();

    log::debug!(
        "Aggregated {} records into {} {} rows",
        records.len(),
        rows.len(),
        grouping.as_str()
    );
    rows
}

/// Records of one day cover disjoint parts of the population, so both flow
/// and gauge metrics are added here; `max` only applies across days.
fn reduce_day(
    group: &[&TaggedRecord],
    members: &BTreeSet<String>,
    registry: &MetricRegistry,
) -> MetricValues {
    let mut base = MetricValues::new();
    for spec in registry.specs() {
        let value = match spec.aggregate {
            AggregateFn::Sum | AggregateFn::Max => {
                group.iter().map(|r| r.values.value(&spec.name)).sum()
            }
            AggregateFn::DistinctCount => members.len() as f64,
        };
        base.insert(spec.name.clone(), value);
    }
    registry.finish(base)
}

/// Combine rows of several dimensions into one daily series under `key`:
/// metrics are added per date and member sets unioned.
pub fn merge_by_date(
    rows: &[&AggregatedRow],
    key: &DimensionKey,
    registry: &MetricRegistry,
) -> Vec<AggregatedRow> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&AggregatedRow>> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.date).or_default().push(row);
    }

    by_date
        .into_iter()
        .map(|(date, day_rows)| {
            let members: BTreeSet<String> = day_rows
                .iter()
                .flat_map(|r| r.members.iter().cloned())
                .collect();
            let mut base = MetricValues::new();
            for spec in registry.specs() {
                let value = match spec.aggregate {
                    AggregateFn::Sum | AggregateFn::Max => {
                        day_rows.iter().map(|r| r.values.value(&spec.name)).sum()
                    }
                    // Rows without member detail still contribute their count.
                    AggregateFn::DistinctCount if members.is_empty() => {
                        day_rows.iter().map(|r| r.values.value(&spec.name)).sum()
                    }
                    AggregateFn::DistinctCount => members.len() as f64,
                };
                base.insert(spec.name.clone(), value);
            }
            AggregatedRow {
                key: key.clone(),
                sub_entity: None,
                date,
                values: registry.finish(base),
                members,
            }
        })
        .collect()
}

/// Merge dimension rows into one daily series per top-level group (the
/// key's parent label, or [`crate::dimension::OTHER_GROUP`]).
pub fn merge_by_top_level(rows: &[AggregatedRow], registry: &MetricRegistry) -> Vec<AggregatedRow> {
    let mut groups: BTreeMap<&str, Vec<&AggregatedRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.key.group()).or_default().push(row);
    }
    groups
        .into_iter()
        .flat_map(|(group, members)| {
            let key = DimensionKey::from_segments(vec![group.to_string()]);
            merge_by_date(&members, &key, registry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{KeyBuilder, RawRecord};
    use crate::metrics::{ACTIVE_SUB_ENTITIES, DAILY_ACTIVE, TOTAL_VOLUME};

    fn raw(levels: &[&str], sub: Option<&str>, date: &str, values: &[(&str, &str)]) -> RawRecord {
        RawRecord {
            date: date.to_string(),
            levels: levels.iter().map(|s| s.to_string()).collect(),
            sub_entity: sub.map(|s| s.to_string()),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn sample() -> Vec<TaggedRecord> {
        KeyBuilder::default()
            .tag(vec![
                raw(
                    &["Alice", "Bob"],
                    Some("k1"),
                    "2025-06-02",
                    &[("Reg", "3"), (DAILY_ACTIVE, "5"), ("Spot Vol ($)", "1,000.126"), ("Futures Vol ($)", "20")],
                ),
                raw(
                    &["Alice", "Bob"],
                    Some("k2"),
                    "2025-06-02",
                    &[("Reg", "2"), (DAILY_ACTIVE, "4"), ("Spot Vol ($)", "abc")],
                ),
                raw(&["Alice", "Bob"], None, "2025-06-01", &[("Reg", "1")]),
                raw(&["Alice", "Carol"], Some("k3"), "2025-06-02", &[("Reg", "7")]),
            ])
            .records
    }

    #[test]
    fn test_aggregate_by_dimension() {
        let reg = MetricRegistry::standard();
        let rows = aggregate(&sample(), Grouping::Dimension, &reg);
        assert_eq!(rows.len(), 3);

        // Ordered by key then date
        assert_eq!(rows[0].key.to_string(), "Alice - Bob");
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(rows[0].values.value(ACTIVE_SUB_ENTITIES), 0.0);

        let bob = &rows[1];
        assert_eq!(bob.values.value("Reg"), 5.0);
        assert_eq!(bob.values.value(DAILY_ACTIVE), 9.0);
        assert_eq!(bob.values.value("Spot Vol ($)"), 1000.13);
        assert_eq!(bob.values.value(TOTAL_VOLUME), 1020.13);
        assert_eq!(bob.values.value(ACTIVE_SUB_ENTITIES), 2.0);
        assert_eq!(bob.members.len(), 2);

        assert_eq!(rows[2].key.to_string(), "Alice - Carol");
    }

    #[test]
    fn test_derived_equals_sum_of_bases() {
        let reg = MetricRegistry::standard();
        for row in aggregate(&sample(), Grouping::Dimension, &reg) {
            let expected = row.values.value("Spot Vol ($)") + row.values.value("Futures Vol ($)");
            assert!((row.values.value(TOTAL_VOLUME) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_aggregate_by_sub_entity_skips_blank_and_zeroes_distinct() {
        let reg = MetricRegistry::standard();
        let rows = aggregate(&sample(), Grouping::SubEntity, &reg);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.sub_entity.is_some()));
        assert!(rows.iter().all(|r| r.values.get(ACTIVE_SUB_ENTITIES) == Some(0.0)));
        assert!(rows.iter().all(|r| r.members.is_empty()));
        assert_eq!(rows[0].sub_entity.as_deref(), Some("k1"));
        assert_eq!(rows[0].values.value("Reg"), 3.0);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let reg = MetricRegistry::standard();
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(
            aggregate(&sample(), Grouping::Dimension, &reg),
            aggregate(&reversed, Grouping::Dimension, &reg)
        );
    }

    #[test]
    fn test_merge_by_top_level() {
        let reg = MetricRegistry::standard();
        let records = {
            let mut r = sample();
            r.extend(
                KeyBuilder::default()
                    .tag(vec![raw(&["", "Solo"], Some("k9"), "2025-06-02", &[("Reg", "4")])])
                    .records,
            );
            r
        };
        let rows = aggregate(&records, Grouping::Dimension, &reg);
        let merged = merge_by_top_level(&rows, &reg);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].key.to_string(), "Alice");
        assert_eq!(merged[0].values.value("Reg"), 1.0);
        assert_eq!(merged[1].values.value("Reg"), 12.0);
        assert_eq!(merged[1].values.value(ACTIVE_SUB_ENTITIES), 3.0);
        assert_eq!(merged[2].key.to_string(), "Other");
        assert_eq!(merged[2].values.value("Reg"), 4.0);
    }
}
