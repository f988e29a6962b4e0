use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::date_util::parse_date;
use crate::metrics::{parse_metric_value, MetricValues};

/// Separator between hierarchy levels in a rendered key.
pub const KEY_SEPARATOR: &str = " - ";

/// Marker carried by departed/inactive entities in the source data.
pub const DEFAULT_EXCLUSION_MARKER: &str = "离职";

/// Group name for keys that have no parent level.
pub const OTHER_GROUP: &str = "Other";

/// One row of source data, exactly as ingested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub date: String,
    /// Hierarchy labels, outermost first (e.g. supervisor, representative).
    pub levels: Vec<String>,
    pub sub_entity: Option<String>,
    /// Raw metric text keyed by metric name.
    pub values: BTreeMap<String, String>,
}

/// Ordered, non-empty hierarchy labels identifying a business unit.
///
/// Empty levels are never stored, so `("Alice", "")` and `("", "Alice")`
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionKey {
    segments: Vec<String>,
}

impl DimensionKey {
    /// Build a key from labels, dropping blank ones.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self {
            segments: segments
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The outermost label, when the key has more than one level.
    pub fn parent(&self) -> Option<&str> {
        if self.segments.len() >= 2 {
            self.segments.first().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// The innermost label.
    pub fn leaf(&self) -> &str {
        self.segments.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// Top-level group this key rolls up into.
    pub fn group(&self) -> &str {
        self.parent().unwrap_or(OTHER_GROUP)
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join(KEY_SEPARATOR))
    }
}

/// A record that passed filtering: keyed, dated, numeric.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRecord {
    pub key: DimensionKey,
    pub date: NaiveDate,
    pub sub_entity: Option<String>,
    pub values: MetricValues,
}

/// Output of [`KeyBuilder::tag`] with per-reason drop counts.
#[derive(Debug, Clone, Default)]
pub struct TagOutcome {
    pub records: Vec<TaggedRecord>,
    /// Dropped because a level carried the exclusion marker.
    pub excluded: usize,
    /// Dropped because every hierarchy level was blank.
    pub unkeyed: usize,
    /// Dropped because the date could not be parsed.
    pub undated: usize,
}

impl TagOutcome {
    pub fn dropped(&self) -> usize {
        self.excluded + self.unkeyed + self.undated
    }
}

/// Normalizes hierarchy labels into [`DimensionKey`]s and filters out
/// inactive entities.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    exclusion_marker: String,
    null_markers: Vec<String>,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSION_MARKER)
    }
}

impl KeyBuilder {
    pub fn new(exclusion_marker: &str) -> Self {
        Self {
            exclusion_marker: exclusion_marker.to_string(),
            null_markers: vec!["0".into(), "nan".into()],
        }
    }

    /// Trimmed label, with "no value" markers (blank, `0`, `nan`) mapped to
    /// the empty string.
    pub fn canonical_level<'a>(&self, raw: &'a str) -> &'a str {
        let trimmed = raw.trim();
        if self
            .null_markers
            .iter()
            .any(|m| trimmed.eq_ignore_ascii_case(m))
        {
            ""
        } else {
            trimmed
        }
    }

    pub fn build<S: AsRef<str>>(&self, levels: &[S]) -> DimensionKey {
        DimensionKey::from_segments(
            levels
                .iter()
                .map(|l| self.canonical_level(l.as_ref()).to_string())
                .collect(),
        )
    }

    fn is_marked(&self, s: &str) -> bool {
        !self.exclusion_marker.is_empty() && s.contains(&self.exclusion_marker)
    }

    /// True when any raw level, the sub-entity, or the built key carries the
    /// exclusion marker.
    pub fn is_excluded(&self, record: &RawRecord, key: &DimensionKey) -> bool {
        record.levels.iter().any(|l| self.is_marked(l))
            || record.sub_entity.as_deref().is_some_and(|s| self.is_marked(s))
            || self.is_marked(&key.to_string())
    }

    /// Key, date-parse and coerce a batch of raw records.
    pub fn tag(&self, records: Vec<RawRecord>) -> TagOutcome {
        let mut outcome = TagOutcome::default();
        for record in records {
            let key = self.build(&record.levels);
            if self.is_excluded(&record, &key) {
                outcome.excluded += 1;
                continue;
            }
            if key.is_empty() {
                outcome.unkeyed += 1;
                continue;
            }
            let Some(date) = parse_date(&record.date) else {
                outcome.undated += 1;
                continue;
            };
            let sub_entity = record
                .sub_entity
                .as_deref()
                .map(|s| self.canonical_level(s))
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            let values = record
                .values
                .iter()
                .map(|(name, raw)| (name.clone(), parse_metric_value(raw)))
                .collect();
            outcome.records.push(TaggedRecord {
                key,
                date,
                sub_entity,
                values,
            });
        }

        if outcome.excluded > 0 {
            log::info!(
                "Filtered {} records marked '{}'",
                outcome.excluded,
                self.exclusion_marker
            );
        }
        if outcome.undated > 0 {
            log::warn!("Dropped {} records with unparseable dates", outcome.undated);
        }
        if outcome.unkeyed > 0 {
            log::warn!("Dropped {} records with no hierarchy labels", outcome.unkeyed);
        }
        outcome
    }
}
