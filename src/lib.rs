pub mod aggregate;
pub mod compare;
pub mod date_util;
pub mod dimension;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod report;
pub mod rollup;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

pub use aggregate::{AggregatedRow, Grouping};
pub use compare::{ChangeRate, Comparison, ComparisonOptions, GroupComparison};
pub use dimension::{DimensionKey, KeyBuilder, RawRecord};
pub use error::{Error, Result};
pub use ingest::ColumnMap;
pub use metrics::{MetricRegistry, MetricValues};
pub use report::{DimensionReport, NoopProgress, ReportKind, ReportProgress};
pub use rollup::{BucketKind, RollupRow, TimeBucket};
pub use storage::Database;

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{ImportLogEntry, WarehouseStatus};

use storage::repository;

pub const CONFIG_EXCLUSION_MARKER: &str = "exclusion_marker";
pub const CONFIG_LOOKBACK_DAYS: &str = "lookback_days";
pub const CONFIG_SORT_METRIC: &str = "sort_metric";

/// Keys accepted by `config set`.
pub const CONFIG_KEYS: &[&str] = &[CONFIG_EXCLUSION_MARKER, CONFIG_LOOKBACK_DAYS, CONFIG_SORT_METRIC];

/// Effective settings: stored `app_config` values over built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub exclusion_marker: String,
    pub lookback_days: i64,
    pub sort_metric: String,
}

impl Default for Settings {
    fn default() -> Self {
        let compare = ComparisonOptions::default();
        Self {
            exclusion_marker: dimension::DEFAULT_EXCLUSION_MARKER.to_string(),
            lookback_days: compare.lookback_days,
            sort_metric: compare.sort_metric,
        }
    }
}

/// Summary of one import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub import_id: i64,
    pub source: String,
    pub records_read: usize,
    pub records_excluded: usize,
    pub records_unkeyed: usize,
    pub records_undated: usize,
    pub dimension_rows: usize,
    pub sub_entity_rows: usize,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

/// Main entry point for the rollup warehouse.
pub struct RollupDW {
    db: Database,
    registry: Arc<MetricRegistry>,
}

impl RollupDW {
    /// Use the standard metric registry.
    pub fn new(db: Database) -> Self {
        Self::with_registry(db, Arc::new(MetricRegistry::standard()))
    }

    pub fn with_registry(db: Database, registry: Arc<MetricRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    // ── Import ─────────────────────────────────────────────────────

    /// Read a CSV export and store it at both granularities.
    pub async fn import_csv(&self, path: &Path, columns: &ColumnMap) -> Result<ImportReport> {
        let records = {
            let path = path.to_path_buf();
            let columns = columns.clone();
            let registry = Arc::clone(&self.registry);
            tokio::task::spawn_blocking(move || ingest::read_path(&path, &columns, &registry))
                .await??
        };
        self.import_records(&path.display().to_string(), records).await
    }

    /// Tag, aggregate and store already-read records. Every stored row for a
    /// (dimension, date) present in `records` is replaced, at both
    /// granularities.
    pub async fn import_records(&self, source: &str, records: Vec<RawRecord>) -> Result<ImportReport> {
        let settings = self.settings().await?;
        let records_read = records.len();

        let registry = Arc::clone(&self.registry);
        let (outcome, by_dimension, by_sub_entity) = tokio::task::spawn_blocking(move || {
            let outcome = KeyBuilder::new(&settings.exclusion_marker).tag(records);
            let by_dimension = aggregate::aggregate(&outcome.records, Grouping::Dimension, &registry);
            let by_sub_entity = aggregate::aggregate(&outcome.records, Grouping::SubEntity, &registry);
            (outcome, by_dimension, by_sub_entity)
        })
        .await?;

        let min_date = by_dimension.iter().map(|r| r.date).min();
        let max_date = by_dimension.iter().map(|r| r.date).max();
        let mut entry = ImportLogEntry {
            source: source.to_string(),
            records_read,
            records_excluded: outcome.excluded,
            records_unkeyed: outcome.unkeyed,
            records_undated: outcome.undated,
            min_date,
            max_date,
            ..Default::default()
        };

        let (import_id, dimension_rows, sub_entity_rows) = self
            .db
            .writer()
            .call({
                let entry = entry.clone();
                move |conn| {
                    let tx = conn.transaction()?;
                    let id = repository::insert_import_log(&tx, &entry)?;
                    let dims =
                        repository::replace_daily_rows(&tx, Grouping::Dimension, &by_dimension, Some(id))?;
                    repository::clear_sub_entity_days(&tx, &by_dimension)?;
                    let subs =
                        repository::replace_daily_rows(&tx, Grouping::SubEntity, &by_sub_entity, Some(id))?;
                    repository::update_import_rows_written(&tx, id, dims + subs)?;
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>((id, dims, subs))
                }
            })
            .await?;
        entry.id = import_id;

        log::info!(
            "Imported {source}: {records_read} records, {} dropped, {dimension_rows} dimension rows, {sub_entity_rows} sub-entity rows",
            outcome.dropped()
        );
        Ok(ImportReport {
            import_id,
            source: entry.source,
            records_read,
            records_excluded: entry.records_excluded,
            records_unkeyed: entry.records_unkeyed,
            records_undated: entry.records_undated,
            dimension_rows,
            sub_entity_rows,
            min_date,
            max_date,
        })
    }

    pub async fn load_rows(&self, grouping: Grouping) -> Result<Vec<AggregatedRow>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::load_daily_rows(conn, grouping))
            .await?)
    }

    // ── Reports ────────────────────────────────────────────────────

    /// Build reports of one kind, optionally only those matching `name`
    /// (title, supervisor or rendered key).
    pub async fn reports(
        &self,
        kind: ReportKind,
        name: Option<&str>,
        progress: &dyn ReportProgress,
    ) -> Result<Vec<DimensionReport>> {
        let grouping = match kind {
            ReportKind::SubEntity => Grouping::SubEntity,
            ReportKind::Representative | ReportKind::Team => Grouping::Dimension,
        };
        let rows = self.load_rows(grouping).await?;
        let registry = Arc::clone(&self.registry);
        let mut reports = match kind {
            ReportKind::Representative => report::representative_reports(rows, registry, progress).await?,
            ReportKind::SubEntity => report::sub_entity_reports(rows, registry, progress).await?,
            ReportKind::Team => report::team_reports(rows, registry, progress).await?,
        };
        if let Some(name) = name {
            reports.retain(|r| r.matches(name));
        }
        Ok(reports)
    }

    // ── Compare ────────────────────────────────────────────────────

    /// Comparison options from stored settings.
    pub async fn comparison_options(&self) -> Result<ComparisonOptions> {
        let settings = self.settings().await?;
        Ok(ComparisonOptions {
            lookback_days: settings.lookback_days,
            sort_metric: settings.sort_metric,
            ..Default::default()
        })
    }

    /// Latest day against the previous one, per top-level group.
    pub async fn compare(&self, opts: &ComparisonOptions) -> Result<Comparison> {
        let rows = self.load_rows(Grouping::Dimension).await?;
        let grouped = aggregate::merge_by_top_level(&rows, &self.registry);
        compare::compare(&grouped, opts, &self.registry)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<WarehouseStatus> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::warehouse_status(conn))
            .await?)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Store a setting after checking that its value is usable.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.validate_config(key, value)?;
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn validate_config(&self, key: &str, value: &str) -> Result<()> {
        match key {
            CONFIG_EXCLUSION_MARKER => Ok(()),
            CONFIG_LOOKBACK_DAYS => parse_lookback(value).map(|_| ()),
            CONFIG_SORT_METRIC => self
                .registry
                .require(value)
                .map_err(|e| Error::Config(e.to_string())),
            other => Err(Error::Config(format!(
                "unknown config key '{other}' (expected one of: {})",
                CONFIG_KEYS.join(", ")
            ))),
        }
    }

    /// Effective settings. Stored values that no longer validate are
    /// skipped with a warning.
    pub async fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::default();
        for (key, value) in self.config_list().await? {
            if let Err(e) = self.validate_config(&key, &value) {
                log::warn!("Ignoring config {key}={value}: {e}");
                continue;
            }
            match key.as_str() {
                CONFIG_EXCLUSION_MARKER => settings.exclusion_marker = value,
                CONFIG_LOOKBACK_DAYS => settings.lookback_days = parse_lookback(&value)?,
                CONFIG_SORT_METRIC => settings.sort_metric = value,
                _ => {}
            }
        }
        Ok(settings)
    }
}

fn parse_lookback(value: &str) -> Result<i64> {
    match value.trim().parse::<i64>() {
        Ok(days) if (0..=compare::MAX_LOOKBACK_DAYS).contains(&days) => Ok(days),
        _ => Err(Error::Config(format!(
            "lookback_days must be an integer from 0 to {}, got '{value}'",
            compare::MAX_LOOKBACK_DAYS
        ))),
    }
}
