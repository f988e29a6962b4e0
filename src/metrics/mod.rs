pub mod types;

pub use types::*;

use std::collections::{BTreeSet, HashSet};

use crate::aggregate::AggregatedRow;
use crate::error::{Error, Result};

pub const TOTAL_VOLUME: &str = "Total Vol ($)";
pub const ACTIVE_SUB_ENTITIES: &str = "Activate KOL";
pub const DAILY_ACTIVE: &str = "DAU";

/// Read-only declaration of every metric the pipeline knows about.
///
/// Built once at startup and shared (behind an `Arc`) by every stage; nothing
/// mutates it afterwards.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    specs: Vec<MetricSpec>,
    derived: Vec<DerivedMetric>,
    display_order: Vec<String>,
}

impl MetricRegistry {
    /// Build a registry, rejecting duplicate names and derived metrics whose
    /// addends are not registered base metrics.
    pub fn new(specs: Vec<MetricSpec>, derived: Vec<DerivedMetric>) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in specs.iter().map(|s| &s.name).chain(derived.iter().map(|d| &d.name)) {
            if name.trim().is_empty() {
                return Err(Error::InvalidRegistry("metric with empty name".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidRegistry(format!("duplicate metric: {name}")));
            }
        }
        for d in &derived {
            if d.addends.is_empty() {
                return Err(Error::InvalidRegistry(format!(
                    "derived metric {} has no addends",
                    d.name
                )));
            }
            for addend in &d.addends {
                if !specs.iter().any(|s| &s.name == addend) {
                    return Err(Error::InvalidRegistry(format!(
                        "derived metric {} references unknown base metric {addend}",
                        d.name
                    )));
                }
            }
        }
        let display_order = specs
            .iter()
            .map(|s| s.name.clone())
            .chain(derived.iter().map(|d| d.name.clone()))
            .collect();
        Ok(Self {
            specs,
            derived,
            display_order,
        })
    }

    /// Replace the column order used for display. Every name must be
    /// registered; metrics left out are still aggregated, just not shown.
    pub fn with_display_order(mut self, order: &[&str]) -> Result<Self> {
        for name in order {
            self.require(name)?;
        }
        self.display_order = order.iter().map(|s| s.to_string()).collect();
        Ok(self)
    }

    /// The registry for the standard daily business export.
    pub fn standard() -> Self {
        use MetricKind::{Float, Integer};

        let specs = vec![
            MetricSpec::sum("Reg", "注册用户", Integer),
            MetricSpec::sum("FTD", "FTD", Integer),
            MetricSpec::sum("FTT", "FTT", Integer),
            MetricSpec::sum("Deposit ($)", "充值折U", Float),
            MetricSpec::sum("Withdraw ($)", "提现折U", Float),
            MetricSpec::sum("Net Deposit ($)", "净充值折U", Float),
            MetricSpec::max(DAILY_ACTIVE, "交易人数", Integer),
            MetricSpec::sum("Spot Vol ($)", "现货交易金额", Float),
            MetricSpec::sum("Spot Fee ($)", "现货交易手续费", Float),
            MetricSpec::sum("Futures Vol ($)", "合约交易金额", Float),
            MetricSpec::sum("Futures Fee ($)", "合约交易手续费", Float),
            MetricSpec::sum("Total Fee ($)", "手续费(现货&合约)", Float),
            MetricSpec::sum("Profit Fee ($)", "净手续费(现货&合约)", Float),
            MetricSpec::sum("EFTT", "effective FTT", Float),
            MetricSpec::sum("EFTTC", "EFTTC", Integer),
            MetricSpec::sum("Bonus Consumption", "赠金真实消耗", Float),
            MetricSpec::sum("Bonus Transfer Into", "合约赠金净划入", Float),
            MetricSpec::sum("Futures PNL", "合约交易平仓盈亏", Float),
            MetricSpec::distinct_count(ACTIVE_SUB_ENTITIES),
        ];
        let derived = vec![DerivedMetric::sum_of(
            TOTAL_VOLUME,
            &["Spot Vol ($)", "Futures Vol ($)"],
        )];

        Self::new(specs, derived)
            .and_then(|r| {
                r.with_display_order(&[
                    "Reg",
                    "FTD",
                    "FTT",
                    "Deposit ($)",
                    "Withdraw ($)",
                    "Net Deposit ($)",
                    DAILY_ACTIVE,
                    "Spot Vol ($)",
                    "Spot Fee ($)",
                    "Futures Vol ($)",
                    "Futures Fee ($)",
                    TOTAL_VOLUME,
                    "Total Fee ($)",
                    "Profit Fee ($)",
                    ACTIVE_SUB_ENTITIES,
                    "EFTTC",
                    "Bonus Consumption",
                    "Bonus Transfer Into",
                    "Futures PNL",
                ])
            })
            .expect("standard registry is well-formed")
    }

    pub fn specs(&self) -> &[MetricSpec] {
        &self.specs
    }

    pub fn display_order(&self) -> &[String] {
        &self.display_order
    }

    /// Look up a base metric. Asking for a name the registry does not know is
    /// a configuration mistake and fails immediately.
    pub fn spec(&self, name: &str) -> Result<&MetricSpec> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownMetric(name.to_string()))
    }

    /// Succeeds if `name` is a base or derived metric.
    pub fn require(&self, name: &str) -> Result<()> {
        if self.specs.iter().any(|s| s.name == name) || self.derived.iter().any(|d| d.name == name) {
            Ok(())
        } else {
            Err(Error::UnknownMetric(name.to_string()))
        }
    }

    /// Metric name for a source column header, if one is registered.
    pub fn metric_for_column(&self, column: &str) -> Option<&str> {
        self.specs
            .iter()
            .find(|s| s.source.as_deref() == Some(column))
            .map(|s| s.name.as_str())
    }

    /// Round every base metric to its declared kind, then compute derived
    /// metrics from the rounded values so they always equal their addends.
    pub fn finish(&self, base: MetricValues) -> MetricValues {
        let mut out = MetricValues::new();
        for spec in &self.specs {
            out.insert(spec.name.clone(), spec.round(base.value(&spec.name)));
        }
        for d in &self.derived {
            let total: f64 = d.addends.iter().map(|a| out.value(a)).sum();
            out.insert(d.name.clone(), d.round(total));
        }
        out
    }

    /// Reduce already-aggregated daily rows into one bucket: `sum` adds,
    /// `max` keeps the peak day, `distinct_count` counts the union of the
    /// days' member sets.
    pub fn reduce_rows(&self, rows: &[&AggregatedRow]) -> MetricValues {
        let mut base = MetricValues::new();
        for spec in &self.specs {
            let value = match spec.aggregate {
                AggregateFn::Sum => rows.iter().map(|r| r.values.value(&spec.name)).sum(),
                AggregateFn::Max => rows
                    .iter()
                    .map(|r| r.values.value(&spec.name))
                    .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
                    .unwrap_or(0.0),
                AggregateFn::DistinctCount => {
                    let members: BTreeSet<&str> = rows
                        .iter()
                        .flat_map(|r| r.members.iter().map(|m| m.as_str()))
                        .collect();
                    members.len() as f64
                }
            };
            base.insert(spec.name.clone(), value);
        }
        self.finish(base)
    }
}

/// Lenient numeric coercion for source text: thousands separators and
/// surrounding whitespace are ignored, anything unparseable counts as zero.
pub fn parse_metric_value(raw: &str) -> f64 {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("nan") {
        return 0.0;
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKey;
    use chrono::NaiveDate;

    fn row(day: u32, values: &[(&str, f64)], members: &[&str]) -> AggregatedRow {
        AggregatedRow {
            key: DimensionKey::from_segments(vec!["Alice".into()]),
            sub_entity: None,
            date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_metric_value() {
        assert_eq!(parse_metric_value("1,234.5"), 1234.5);
        assert_eq!(parse_metric_value("  42 "), 42.0);
        assert_eq!(parse_metric_value(""), 0.0);
        assert_eq!(parse_metric_value("nan"), 0.0);
        assert_eq!(parse_metric_value("n/a"), 0.0);
        assert_eq!(parse_metric_value("inf"), 0.0);
        assert_eq!(parse_metric_value("-3.25"), -3.25);
    }

    #[test]
    fn test_round_value() {
        assert_eq!(round_value(MetricKind::Integer, 0, 3.99), 3.0);
        assert_eq!(round_value(MetricKind::Integer, 0, -3.99), -3.0);
        assert_eq!(round_value(MetricKind::Float, 2, 1.005_1), 1.01);
        assert_eq!(round_value(MetricKind::Float, 2, 2.344), 2.34);
        assert_eq!(round_value(MetricKind::Float, 2, -0.001), 0.0);
    }

    #[test]
    fn test_standard_registry_shape() {
        let reg = MetricRegistry::standard();
        assert_eq!(reg.spec(DAILY_ACTIVE).unwrap().aggregate, AggregateFn::Max);
        assert_eq!(
            reg.spec(ACTIVE_SUB_ENTITIES).unwrap().aggregate,
            AggregateFn::DistinctCount
        );
        assert_eq!(reg.spec("Reg").unwrap().kind, MetricKind::Integer);
        assert!(reg.require(TOTAL_VOLUME).is_ok());
        assert!(reg.spec(TOTAL_VOLUME).is_err(), "derived metrics are not base specs");
        assert_eq!(reg.metric_for_column("交易人数"), Some(DAILY_ACTIVE));
        assert!(!reg.display_order().iter().any(|n| n == "EFTT"));
        assert_eq!(reg.display_order().len(), 19);
    }

    #[test]
    fn test_unknown_metric_fails_fast() {
        let reg = MetricRegistry::standard();
        match reg.spec("Volume") {
            Err(Error::UnknownMetric(name)) => assert_eq!(name, "Volume"),
            other => panic!("expected UnknownMetric, got {other:?}"),
        }
        assert!(reg.require("Volume").is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_dangling_addends() {
        let dup = MetricRegistry::new(
            vec![
                MetricSpec::sum("A", "a", MetricKind::Integer),
                MetricSpec::sum("A", "b", MetricKind::Integer),
            ],
            vec![],
        );
        assert!(matches!(dup, Err(Error::InvalidRegistry(_))));

        let dangling = MetricRegistry::new(
            vec![MetricSpec::sum("A", "a", MetricKind::Integer)],
            vec![DerivedMetric::sum_of("T", &["A", "B"])],
        );
        assert!(matches!(dangling, Err(Error::InvalidRegistry(_))));

        let bad_order = MetricRegistry::new(vec![MetricSpec::sum("A", "a", MetricKind::Integer)], vec![])
            .unwrap()
            .with_display_order(&["A", "Z"]);
        assert!(matches!(bad_order, Err(Error::UnknownMetric(_))));
    }

    #[test]
    fn test_finish_derives_from_rounded_bases() {
        let reg = MetricRegistry::standard();
        let base: MetricValues = [
            ("Spot Vol ($)".to_string(), 1.234),
            ("Futures Vol ($)".to_string(), 2.346),
            ("Reg".to_string(), 2.7),
        ]
        .into_iter()
        .collect();
        let out = reg.finish(base);
        assert_eq!(out.value("Spot Vol ($)"), 1.23);
        assert_eq!(out.value("Futures Vol ($)"), 2.35);
        assert_eq!(out.value(TOTAL_VOLUME), 3.58);
        assert_eq!(out.value("Reg"), 2.0);
        // Every registered metric is present, absent inputs as zero.
        assert_eq!(out.get("Futures PNL"), Some(0.0));
    }

    #[test]
    fn test_reduce_rows_per_aggregate_fn() {
        let reg = MetricRegistry::standard();
        let a = row(1, &[("Reg", 3.0), (DAILY_ACTIVE, 10.0), ("Spot Vol ($)", 1.5)], &["k1", "k2"]);
        let b = row(2, &[("Reg", 4.0), (DAILY_ACTIVE, 7.0), ("Futures Vol ($)", 2.0)], &["k2", "k3"]);
        let out = reg.reduce_rows(&[&a, &b]);
        assert_eq!(out.value("Reg"), 7.0);
        assert_eq!(out.value(DAILY_ACTIVE), 10.0);
        assert_eq!(out.value(ACTIVE_SUB_ENTITIES), 3.0);
        assert_eq!(out.value(TOTAL_VOLUME), 3.5);
    }

    #[test]
    fn test_reduce_rows_max_with_negative_values() {
        let reg = MetricRegistry::new(
            vec![MetricSpec::max("G", "g", MetricKind::Float)],
            vec![],
        )
        .unwrap();
        let a = row(1, &[("G", -5.0)], &[]);
        let b = row(2, &[("G", -2.0)], &[]);
        assert_eq!(reg.reduce_rows(&[&a, &b]).value("G"), -2.0);
        assert_eq!(reg.reduce_rows(&[]).value("G"), 0.0);
    }
}
