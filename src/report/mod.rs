use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::aggregate::{merge_by_date, AggregatedRow};
use crate::dimension::DimensionKey;
use crate::error::Result;
use crate::metrics::MetricRegistry;
use crate::rollup::{build_rollup, RollupRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// One per dimension key.
    Representative,
    /// One per (dimension key, sub-entity).
    SubEntity,
    /// One per supervisor, over every key under them.
    Team,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Representative => "representative",
            ReportKind::SubEntity => "sub_entity",
            ReportKind::Team => "team",
        }
    }
}

/// A rollup table for one reporting unit.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionReport {
    pub kind: ReportKind,
    pub title: String,
    pub supervisor: Option<String>,
    pub key: DimensionKey,
    pub sub_entity: Option<String>,
    /// Team reports only: leaf labels of the member keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    pub rows: Vec<RollupRow>,
}

impl DimensionReport {
    /// True when `name` is the title, the supervisor, or the rendered key.
    pub fn matches(&self, name: &str) -> bool {
        self.title == name
            || self.supervisor.as_deref() == Some(name)
            || self.key.to_string() == name
    }
}

/// Progress callback trait for report generation.
pub trait ReportProgress: Send + Sync {
    fn on_start(&self, _kind: ReportKind, _total: usize) {}
    fn on_report_complete(&self, _report: &DimensionReport, _done: usize, _total: usize) {}
}

/// A progress reporter that does nothing.
pub struct NoopProgress;

impl ReportProgress for NoopProgress {}

/// Input for one report, before the rollup is built.
struct ReportJob {
    kind: ReportKind,
    title: String,
    supervisor: Option<String>,
    key: DimensionKey,
    sub_entity: Option<String>,
    members: Vec<String>,
    rows: Vec<AggregatedRow>,
    /// Rows of several keys that must be merged per date first.
    merge: bool,
}

impl ReportJob {
    fn run(self, registry: &MetricRegistry) -> Option<DimensionReport> {
        let rows = if self.merge {
            let refs: Vec<&AggregatedRow> = self.rows.iter().collect();
            merge_by_date(&refs, &self.key, registry)
        } else {
            self.rows
        };
        let rollup = build_rollup(&rows, registry);
        if rollup.is_empty() {
            log::debug!("No rows for {} report '{}'", self.kind.as_str(), self.title);
            return None;
        }
        Some(DimensionReport {
            kind: self.kind,
            title: self.title,
            supervisor: self.supervisor,
            key: self.key,
            sub_entity: self.sub_entity,
            members: self.members,
            rows: rollup,
        })
    }
}

/// One report per dimension key, from dimension-level rows.
pub async fn representative_reports(
    rows: Vec<AggregatedRow>,
    registry: Arc<MetricRegistry>,
    progress: &dyn ReportProgress,
) -> Result<Vec<DimensionReport>> {
    let mut by_key: BTreeMap<DimensionKey, Vec<AggregatedRow>> = BTreeMap::new();
    for row in rows {
        by_key.entry(row.key.clone()).or_default().push(row);
    }
    let jobs = by_key
        .into_iter()
        .map(|(key, rows)| ReportJob {
            kind: ReportKind::Representative,
            title: key.leaf().to_string(),
            supervisor: key.parent().map(|s| s.to_string()),
            key,
            sub_entity: None,
            members: Vec::new(),
            rows,
            merge: false,
        })
        .collect();
    run_jobs(ReportKind::Representative, jobs, registry, progress).await
}

/// One report per (dimension key, sub-entity), from sub-entity-level rows.
/// Rows without a sub-entity are ignored.
pub async fn sub_entity_reports(
    rows: Vec<AggregatedRow>,
    registry: Arc<MetricRegistry>,
    progress: &dyn ReportProgress,
) -> Result<Vec<DimensionReport>> {
    let mut by_pair: BTreeMap<(DimensionKey, String), Vec<AggregatedRow>> = BTreeMap::new();
    for row in rows {
        if let Some(sub) = row.sub_entity.clone() {
            by_pair.entry((row.key.clone(), sub)).or_default().push(row);
        }
    }
    let jobs = by_pair
        .into_iter()
        .map(|((key, sub), rows)| ReportJob {
            kind: ReportKind::SubEntity,
            title: sub.clone(),
            supervisor: key.parent().map(|s| s.to_string()),
            key,
            sub_entity: Some(sub),
            members: Vec::new(),
            rows,
            merge: false,
        })
        .collect();
    run_jobs(ReportKind::SubEntity, jobs, registry, progress).await
}

/// One report per supervisor: the rows of every key under the supervisor are
/// added up per date, then rolled up. Keys without a supervisor level belong
/// to no team.
pub async fn team_reports(
    rows: Vec<AggregatedRow>,
    registry: Arc<MetricRegistry>,
    progress: &dyn ReportProgress,
) -> Result<Vec<DimensionReport>> {
    let mut by_supervisor: BTreeMap<String, (Vec<String>, Vec<AggregatedRow>)> = BTreeMap::new();
    for row in rows {
        let Some(supervisor) = row.key.parent().map(|s| s.to_string()) else {
            continue;
        };
        let (members, team_rows) = by_supervisor.entry(supervisor).or_default();
        let leaf = row.key.leaf().to_string();
        if !members.contains(&leaf) {
            members.push(leaf);
        }
        team_rows.push(row);
    }
    let jobs = by_supervisor
        .into_iter()
        .map(|(supervisor, (members, rows))| ReportJob {
            kind: ReportKind::Team,
            title: supervisor.clone(),
            key: DimensionKey::from_segments(vec![supervisor.clone()]),
            supervisor: Some(supervisor),
            sub_entity: None,
            members,
            rows,
            merge: true,
        })
        .collect();
    run_jobs(ReportKind::Team, jobs, registry, progress).await
}

/// Build every job's rollup on the blocking pool, one task per job.
async fn run_jobs(
    kind: ReportKind,
    jobs: Vec<ReportJob>,
    registry: Arc<MetricRegistry>,
    progress: &dyn ReportProgress,
) -> Result<Vec<DimensionReport>> {
    let total = jobs.len();
    progress.on_start(kind, total);
    log::info!("Building {total} {} reports", kind.as_str());

    let mut tasks = JoinSet::new();
    for job in jobs {
        let registry = Arc::clone(&registry);
        tasks.spawn_blocking(move || job.run(&registry));
    }

    let mut reports = Vec::with_capacity(total);
    let mut done = 0;
    while let Some(result) = tasks.join_next().await {
        done += 1;
        if let Some(report) = result? {
            progress.on_report_complete(&report, done, total);
            reports.push(report);
        }
    }

    reports.sort_by(|a, b| {
        (&a.supervisor, &a.title, &a.key, &a.sub_entity).cmp(&(
            &b.supervisor,
            &b.title,
            &b.key,
            &b.sub_entity,
        ))
    });
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, Grouping};
    use crate::dimension::{KeyBuilder, RawRecord};
    use crate::metrics::{ACTIVE_SUB_ENTITIES, DAILY_ACTIVE};
    use crate::rollup::BucketKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(levels: &[&str], sub: &str, date: &str, reg: &str, dau: &str) -> RawRecord {
        RawRecord {
            date: date.to_string(),
            levels: levels.iter().map(|s| s.to_string()).collect(),
            sub_entity: Some(sub.to_string()),
            values: [
                ("Reg".to_string(), reg.to_string()),
                (DAILY_ACTIVE.to_string(), dau.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn records() -> Vec<RawRecord> {
        vec![
            raw(&["Alice", "Bob"], "k1", "2025-06-02", "1", "5"),
            raw(&["Alice", "Bob"], "k2", "2025-06-02", "2", "6"),
            raw(&["Alice", "Bob"], "k1", "2025-06-03", "3", "2"),
            raw(&["Alice", "Carol"], "k3", "2025-06-02", "4", "7"),
            raw(&["", "Solo"], "k4", "2025-06-02", "5", "1"),
        ]
    }

    fn rows(grouping: Grouping) -> Vec<AggregatedRow> {
        let reg = MetricRegistry::standard();
        let tagged = KeyBuilder::default().tag(records()).records;
        aggregate(&tagged, grouping, &reg)
    }

    fn total(report: &DimensionReport) -> &RollupRow {
        report.rows.last().unwrap()
    }

    #[tokio::test]
    async fn test_representative_reports() {
        let reg = Arc::new(MetricRegistry::standard());
        let reports = representative_reports(rows(Grouping::Dimension), reg, &NoopProgress)
            .await
            .unwrap();

        let titles: Vec<&str> = reports.iter().map(|r| r.title.as_str()).collect();
        // No supervisor sorts first
        assert_eq!(titles, vec!["Solo", "Bob", "Carol"]);

        let bob = &reports[1];
        assert_eq!(bob.kind, ReportKind::Representative);
        assert_eq!(bob.supervisor.as_deref(), Some("Alice"));
        assert_eq!(total(bob).kind(), BucketKind::Total);
        assert_eq!(total(bob).values().value("Reg"), 6.0);
        // Daily DAU adds across sub-entities (11 on the 2nd), max across days
        assert_eq!(total(bob).values().value(DAILY_ACTIVE), 11.0);
        assert_eq!(total(bob).values().value(ACTIVE_SUB_ENTITIES), 2.0);
    }

    #[tokio::test]
    async fn test_sub_entity_reports() {
        let reg = Arc::new(MetricRegistry::standard());
        let reports = sub_entity_reports(rows(Grouping::SubEntity), reg, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(reports.len(), 4);

        let k1 = reports.iter().find(|r| r.title == "k1").unwrap();
        assert_eq!(k1.kind, ReportKind::SubEntity);
        assert_eq!(k1.key.to_string(), "Alice - Bob");
        assert_eq!(total(k1).values().value("Reg"), 4.0);
        assert_eq!(total(k1).values().value(DAILY_ACTIVE), 5.0);
        assert_eq!(total(k1).values().value(ACTIVE_SUB_ENTITIES), 0.0);
    }

    #[tokio::test]
    async fn test_team_reports_merge_members() {
        let reg = Arc::new(MetricRegistry::standard());
        let reports = team_reports(rows(Grouping::Dimension), reg, &NoopProgress)
            .await
            .unwrap();

        // The single-level key has no team.
        assert_eq!(reports.len(), 1);
        let team = &reports[0];
        assert_eq!(team.kind, ReportKind::Team);
        assert_eq!(team.title, "Alice");
        assert_eq!(team.members, vec!["Bob", "Carol"]);

        let daily: Vec<&RollupRow> = team
            .rows
            .iter()
            .filter(|r| r.kind() == BucketKind::Daily)
            .collect();
        assert_eq!(daily.len(), 2);
        // 2025-06-02: Bob 3 + Carol 4
        assert_eq!(daily[1].label(), "2025-06-02");
        assert_eq!(daily[1].values().value("Reg"), 7.0);
        assert_eq!(daily[1].values().value(DAILY_ACTIVE), 18.0);
        assert_eq!(daily[1].values().value(ACTIVE_SUB_ENTITIES), 3.0);

        assert_eq!(total(team).values().value("Reg"), 10.0);
        assert_eq!(total(team).values().value(ACTIVE_SUB_ENTITIES), 3.0);
        assert!(team.matches("Alice"));
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_reports() {
        let reg = Arc::new(MetricRegistry::standard());
        let reports = representative_reports(Vec::new(), reg, &NoopProgress)
            .await
            .unwrap();
        assert!(reports.is_empty());
    }

    #[derive(Default)]
    struct CountingProgress {
        started: AtomicUsize,
        completed: AtomicUsize,
    }

    impl ReportProgress for CountingProgress {
        fn on_start(&self, _kind: ReportKind, total: usize) {
            self.started.store(total, Ordering::SeqCst);
        }

        fn on_report_complete(&self, _report: &DimensionReport, _done: usize, _total: usize) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_progress_is_notified() {
        let reg = Arc::new(MetricRegistry::standard());
        let progress = CountingProgress::default();
        representative_reports(rows(Grouping::Dimension), reg, &progress)
            .await
            .unwrap();
        assert_eq!(progress.started.load(Ordering::SeqCst), 3);
        assert_eq!(progress.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reports_are_deterministic() {
        let reg = Arc::new(MetricRegistry::standard());
        let first = representative_reports(rows(Grouping::Dimension), reg.clone(), &NoopProgress)
            .await
            .unwrap();
        let mut reversed = rows(Grouping::Dimension);
        reversed.reverse();
        let second = representative_reports(reversed, reg, &NoopProgress).await.unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
