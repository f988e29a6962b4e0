use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::aggregate::{AggregatedRow, Grouping};
use crate::dimension::DimensionKey;
use crate::metrics::MetricValues;

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Import log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportLogEntry {
    pub id: i64,
    pub source: String,
    pub imported_at: String,
    pub records_read: usize,
    pub records_excluded: usize,
    pub records_unkeyed: usize,
    pub records_undated: usize,
    pub rows_written: usize,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

/// Record an import and return its id. `id` and `imported_at` on the entry
/// are ignored.
pub fn insert_import_log(conn: &Connection, entry: &ImportLogEntry) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO import_log (
            source, imported_at, records_read, records_excluded,
            records_unkeyed, records_undated, rows_written, min_date, max_date
         ) VALUES (?1, datetime('now'), ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.source,
            entry.records_read as i64,
            entry.records_excluded as i64,
            entry.records_unkeyed as i64,
            entry.records_undated as i64,
            entry.rows_written as i64,
            entry.min_date.map(date_key),
            entry.max_date.map(date_key),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_import_rows_written(
    conn: &Connection,
    import_id: i64,
    rows_written: usize,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE import_log SET rows_written = ?2 WHERE id = ?1",
        params![import_id, rows_written as i64],
    )?;
    Ok(())
}

pub fn last_import(conn: &Connection) -> Result<Option<ImportLogEntry>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, source, imported_at, records_read, records_excluded,
                records_unkeyed, records_undated, rows_written, min_date, max_date
         FROM import_log ORDER BY id DESC LIMIT 1",
        [],
        |row| {
            Ok(ImportLogEntry {
                id: row.get(0)?,
                source: row.get(1)?,
                imported_at: row.get(2)?,
                records_read: row.get::<_, i64>(3)? as usize,
                records_excluded: row.get::<_, i64>(4)? as usize,
                records_unkeyed: row.get::<_, i64>(5)? as usize,
                records_undated: row.get::<_, i64>(6)? as usize,
                rows_written: row.get::<_, i64>(7)? as usize,
                min_date: optional_date(row.get(8)?, 8)?,
                max_date: optional_date(row.get(9)?, 9)?,
            })
        },
    )
    .optional()
}

// ── Daily facts ────────────────────────────────────────────────────

/// Store aggregated rows, replacing whatever an earlier import stored for
/// the same grouping, sub-entity, dimension and date. Returns the number of
/// rows written.
pub fn replace_daily_rows(
    conn: &Connection,
    grouping: Grouping,
    rows: &[AggregatedRow],
    import_id: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    let mut delete_metrics = conn.prepare_cached(
        "DELETE FROM fact_daily_metrics
         WHERE grouping = ?1 AND sub_entity = ?2 AND key_levels = ?3 AND date_key = ?4",
    )?;
    let mut insert_metric = conn.prepare_cached(
        "INSERT INTO fact_daily_metrics
            (grouping, sub_entity, key_levels, key_label, date_key, metric, value, import_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    let mut delete_members = conn.prepare_cached(
        "DELETE FROM fact_daily_members WHERE key_levels = ?1 AND date_key = ?2",
    )?;
    let mut insert_member = conn.prepare_cached(
        "INSERT OR IGNORE INTO fact_daily_members (key_levels, date_key, member)
         VALUES (?1, ?2, ?3)",
    )?;

    for row in rows {
        let levels = key_levels(&row.key)?;
        let label = row.key.to_string();
        let date = date_key(row.date);
        let sub = row.sub_entity.as_deref().unwrap_or("");

        delete_metrics.execute(params![grouping.as_str(), sub, levels, date])?;
        for (metric, value) in row.values.iter() {
            insert_metric.execute(params![
                grouping.as_str(),
                sub,
                levels,
                label,
                date,
                metric,
                value,
                import_id
            ])?;
        }

        if grouping == Grouping::Dimension {
            delete_members.execute(params![levels, date])?;
            for member in &row.members {
                insert_member.execute(params![levels, date, member])?;
            }
        }
    }
    Ok(rows.len())
}

/// Drop every stored sub-entity row for the (dimension, date) pairs of
/// `rows`, so a sub-entity missing from a later export does not outlive it.
/// Returns the number of metric values deleted.
pub fn clear_sub_entity_days(
    conn: &Connection,
    rows: &[AggregatedRow],
) -> Result<usize, rusqlite::Error> {
    let mut delete = conn.prepare_cached(
        "DELETE FROM fact_daily_metrics
         WHERE grouping = ?1 AND key_levels = ?2 AND date_key = ?3",
    )?;
    let days: BTreeSet<(String, String)> = rows
        .iter()
        .map(|row| Ok((key_levels(&row.key)?, date_key(row.date))))
        .collect::<Result<_, rusqlite::Error>>()?;

    let mut deleted = 0;
    for (levels, date) in &days {
        deleted += delete.execute(params![Grouping::SubEntity.as_str(), levels, date])?;
    }
    Ok(deleted)
}

/// Rebuild the stored rows of one grouping, ordered by dimension key,
/// sub-entity, then date.
pub fn load_daily_rows(
    conn: &Connection,
    grouping: Grouping,
) -> Result<Vec<AggregatedRow>, rusqlite::Error> {
    type RowKey = (DimensionKey, Option<String>, NaiveDate);
    let mut rows: BTreeMap<RowKey, MetricValues> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT key_levels, sub_entity, date_key, metric, value
         FROM fact_daily_metrics WHERE grouping = ?1",
    )?;
    let mut query = stmt.query(params![grouping.as_str()])?;
    while let Some(row) = query.next()? {
        let key = parse_key_levels(row.get(0)?, 0)?;
        let sub: String = row.get(1)?;
        let date = parse_date_key(row.get(2)?, 2)?;
        let metric: String = row.get(3)?;
        let value: f64 = row.get(4)?;
        let sub = if sub.is_empty() { None } else { Some(sub) };
        rows.entry((key, sub, date)).or_default().insert(metric, value);
    }

    let mut members: BTreeMap<(DimensionKey, NaiveDate), BTreeSet<String>> = BTreeMap::new();
    if grouping == Grouping::Dimension {
        let mut stmt = conn.prepare("SELECT key_levels, date_key, member FROM fact_daily_members")?;
        let mut query = stmt.query([])?;
        while let Some(row) = query.next()? {
            let key = parse_key_levels(row.get(0)?, 0)?;
            let date = parse_date_key(row.get(1)?, 1)?;
            members.entry((key, date)).or_default().insert(row.get(2)?);
        }
    }

    Ok(rows
        .into_iter()
        .map(|((key, sub_entity, date), values)| {
            let members = members.remove(&(key.clone(), date)).unwrap_or_default();
            AggregatedRow {
                key,
                sub_entity,
                date,
                values,
                members,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarehouseStatus {
    pub dimension_rows: usize,
    pub sub_entity_rows: usize,
    pub dimensions: usize,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    pub last_import: Option<ImportLogEntry>,
}

pub fn warehouse_status(conn: &Connection) -> Result<WarehouseStatus, rusqlite::Error> {
    let count_rows = |grouping: Grouping| -> Result<usize, rusqlite::Error> {
        conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT DISTINCT sub_entity, key_levels, date_key
                FROM fact_daily_metrics WHERE grouping = ?1
             )",
            params![grouping.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
    };
    let dimensions: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT key_levels) FROM fact_daily_metrics WHERE grouping = ?1",
        params![Grouping::Dimension.as_str()],
        |row| row.get(0),
    )?;
    let (min_date, max_date): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(date_key), MAX(date_key) FROM fact_daily_metrics",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(WarehouseStatus {
        dimension_rows: count_rows(Grouping::Dimension)?,
        sub_entity_rows: count_rows(Grouping::SubEntity)?,
        dimensions: dimensions as usize,
        min_date: optional_date(min_date, 0)?,
        max_date: optional_date(max_date, 1)?,
        last_import: last_import(conn)?,
    })
}

// ── Helpers ────────────────────────────────────────────────────────

fn date_key(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_date_key(s: String, idx: usize) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn optional_date(s: Option<String>, idx: usize) -> Result<Option<NaiveDate>, rusqlite::Error> {
    s.map(|s| parse_date_key(s, idx)).transpose()
}

fn key_levels(key: &DimensionKey) -> Result<String, rusqlite::Error> {
    serde_json::to_string(key).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_key_levels(s: String, idx: usize) -> Result<DimensionKey, rusqlite::Error> {
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}
