use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, Trim};

use crate::dimension::RawRecord;
use crate::error::{Error, Result};
use crate::metrics::MetricRegistry;

/// Which source columns carry the date, the hierarchy levels and the
/// sub-entity identifier. Metric columns come from the registry.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    pub date: String,
    /// Outermost level first.
    pub levels: Vec<String>,
    /// Optional; when the column is missing every record has no sub-entity.
    pub sub_entity: Option<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            date: "统计日期".to_string(),
            levels: vec!["商务总监".to_string(), "商务BD".to_string()],
            sub_entity: Some("总代理".to_string()),
        }
    }
}

fn column_index(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

/// Read raw records from CSV with a header row.
///
/// Values are kept as text; coercion happens when records are tagged.
pub fn read_records<R: Read>(
    reader: R,
    columns: &ColumnMap,
    registry: &MetricRegistry,
) -> Result<Vec<RawRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let date_idx = column_index(&headers, &columns.date)
        .ok_or_else(|| Error::Ingest(format!("missing date column '{}'", columns.date)))?;
    let level_idx = columns
        .levels
        .iter()
        .map(|name| {
            column_index(&headers, name)
                .ok_or_else(|| Error::Ingest(format!("missing level column '{name}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    let sub_idx = columns
        .sub_entity
        .as_deref()
        .and_then(|name| column_index(&headers, name));
    if columns.sub_entity.is_some() && sub_idx.is_none() {
        log::warn!("Sub-entity column not found; distinct counts will be zero");
    }

    let metric_idx: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| registry.metric_for_column(h).map(|m| (i, m.to_string())))
        .collect();
    log::debug!(
        "Mapped {} of {} columns to metrics",
        metric_idx.len(),
        headers.len()
    );

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let field = |i: usize| row.get(i).unwrap_or("").to_string();
        records.push(RawRecord {
            date: field(date_idx),
            levels: level_idx.iter().map(|&i| field(i)).collect(),
            sub_entity: sub_idx.map(&field),
            values: metric_idx
                .iter()
                .map(|(i, name)| (name.clone(), field(*i)))
                .collect::<BTreeMap<_, _>>(),
        });
    }

    log::info!("Read {} records", records.len());
    Ok(records)
}

pub fn read_path(
    path: &Path,
    columns: &ColumnMap,
    registry: &MetricRegistry,
) -> Result<Vec<RawRecord>> {
    let file = std::fs::File::open(path)?;
    read_records(file, columns, registry)
}
