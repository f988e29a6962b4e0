use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a metric is reduced across the days of a rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Additive flow metric.
    Sum,
    /// Gauge: the peak day wins. Records of a single day are still added,
    /// since they cover disjoint parts of the population.
    Max,
    /// Number of distinct sub-entity identifiers.
    DistinctCount,
}

/// Numeric kind, which decides display rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Integer,
    Float,
}

/// Static declaration of one base metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    /// Column header in the source export. `None` for metrics that are not
    /// read from a column (distinct counts).
    pub source: Option<String>,
    pub aggregate: AggregateFn,
    pub kind: MetricKind,
    /// Decimal places kept for float metrics; ignored for integers.
    pub precision: u32,
}

impl MetricSpec {
    pub fn sum(name: &str, source: &str, kind: MetricKind) -> Self {
        Self::with_fn(name, Some(source), AggregateFn::Sum, kind)
    }

    pub fn max(name: &str, source: &str, kind: MetricKind) -> Self {
        Self::with_fn(name, Some(source), AggregateFn::Max, kind)
    }

    pub fn distinct_count(name: &str) -> Self {
        Self::with_fn(name, None, AggregateFn::DistinctCount, MetricKind::Integer)
    }

    fn with_fn(name: &str, source: Option<&str>, aggregate: AggregateFn, kind: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            source: source.map(|s| s.to_string()),
            aggregate,
            kind,
            precision: match kind {
                MetricKind::Integer => 0,
                MetricKind::Float => 2,
            },
        }
    }

    pub fn round(&self, value: f64) -> f64 {
        round_value(self.kind, self.precision, value)
    }
}

/// A metric computed after reduction as the sum of other metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub name: String,
    pub addends: Vec<String>,
    pub kind: MetricKind,
    pub precision: u32,
}

impl DerivedMetric {
    pub fn sum_of(name: &str, addends: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            addends: addends.iter().map(|a| a.to_string()).collect(),
            kind: MetricKind::Float,
            precision: 2,
        }
    }

    pub fn round(&self, value: f64) -> f64 {
        round_value(self.kind, self.precision, value)
    }
}

/// Integers truncate toward zero; floats round half away from zero.
pub fn round_value(kind: MetricKind, precision: u32, value: f64) -> f64 {
    let rounded = match kind {
        MetricKind::Integer => value.trunc(),
        MetricKind::Float => {
            let factor = 10f64.powi(precision as i32);
            (value * factor).round() / factor
        }
    };
    // Avoid "-0" leaking into output.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Reduced metric values keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricValues(BTreeMap<String, f64>);

impl MetricValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Value for `name`, treating an absent metric as zero.
    pub fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, f64)> for MetricValues {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
