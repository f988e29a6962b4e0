use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use rollupdw::compare::MAX_LOOKBACK_DAYS;
use rollupdw::metrics::MetricKind;
use rollupdw::{
    ColumnMap, Comparison, DimensionReport, MetricRegistry, NoopProgress, ReportKind,
    ReportProgress, RollupDW,
};

#[derive(Parser)]
#[command(name = "rollupdw", about = "Daily metrics rollup warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.rollupdw/rollupdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl ReportProgress for StderrProgress {
    fn on_start(&self, kind: ReportKind, total: usize) {
        eprintln!("Building {total} {} reports...", kind.as_str());
    }

    fn on_report_complete(&self, report: &DimensionReport, done: usize, total: usize) {
        eprintln!("[{done}/{total}] {}", report.title);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Import a daily CSV export into the warehouse
    Import {
        /// Path to the CSV file
        file: PathBuf,
        /// Date column header
        #[arg(long)]
        date_column: Option<String>,
        /// Hierarchy level column headers, outermost first (repeatable)
        #[arg(long = "level-column")]
        level_columns: Vec<String>,
        /// Sub-entity identifier column header
        #[arg(long)]
        sub_entity_column: Option<String>,
    },
    /// Print rollup reports
    Report {
        /// Which reports to build
        #[arg(value_enum)]
        kind: ReportTarget,
        /// Only reports whose title, supervisor or key matches
        #[arg(long)]
        name: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare the latest day with the previous one per top-level group
    Compare {
        /// Lookback window in days (default: config lookback_days)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_LOOKBACK_DAYS))]
        days: Option<i64>,
        /// Metric to rank groups by (default: config sort_metric)
        #[arg(long)]
        sort: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportTarget {
    /// One report per business representative
    Reps,
    /// One report per sub-agent
    Agents,
    /// One report per supervisor team
    Teams,
}

impl From<ReportTarget> for ReportKind {
    fn from(t: ReportTarget) -> Self {
        match t {
            ReportTarget::Reps => ReportKind::Representative,
            ReportTarget::Agents => ReportKind::SubEntity,
            ReportTarget::Teams => ReportKind::Team,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => rollupdw::Database::open_at(path).await?,
        None => rollupdw::Database::open().await?,
    };
    let dw = RollupDW::new(db);

    match cli.command {
        Commands::Import {
            file,
            date_column,
            level_columns,
            sub_entity_column,
        } => {
            let mut columns = ColumnMap::default();
            if let Some(date) = date_column {
                columns.date = date;
            }
            if !level_columns.is_empty() {
                columns.levels = level_columns;
            }
            if let Some(sub) = sub_entity_column {
                columns.sub_entity = Some(sub);
            }
            let report = dw.import_csv(&file, &columns).await?;
            println!("Imported {}", report.source);
            println!("  Records read:     {}", report.records_read);
            println!("  Excluded:         {}", report.records_excluded);
            println!("  Unkeyed:          {}", report.records_unkeyed);
            println!("  Undated:          {}", report.records_undated);
            println!("  Dimension rows:   {}", report.dimension_rows);
            println!("  Sub-entity rows:  {}", report.sub_entity_rows);
            if let (Some(min), Some(max)) = (report.min_date, report.max_date) {
                println!("  Date range:       {min} to {max}");
            }
        }
        Commands::Report { kind, name, json } => {
            let progress: &dyn ReportProgress = if json { &NoopProgress } else { &StderrProgress };
            let reports = dw.reports(kind.into(), name.as_deref(), progress).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("No reports. Import data first, or check --name.");
            } else {
                for report in &reports {
                    print_report(dw.registry(), report);
                }
            }
        }
        Commands::Compare { days, sort, json } => {
            let mut opts = dw.comparison_options().await?;
            if let Some(days) = days {
                opts.lookback_days = days;
            }
            if let Some(sort) = sort {
                opts.sort_metric = sort;
            }
            let cmp = dw.compare(&opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cmp)?);
            } else {
                print_comparison(dw.registry(), &cmp);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => match dw.config_get(&key).await? {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            },
            ConfigAction::Set { key, value } => {
                dw.config_set(&key, &value).await?;
                println!("Config updated.");
            }
            ConfigAction::List => {
                let items = dw.config_list().await?;
                if items.is_empty() {
                    println!("No configuration set.");
                } else {
                    for (k, v) in items {
                        println!("{k} = {v}");
                    }
                }
            }
        },
        Commands::Status => {
            let status = dw.status().await?;
            println!("Warehouse Status");
            println!("  Dimensions:       {}", status.dimensions);
            println!("  Dimension rows:   {}", status.dimension_rows);
            println!("  Sub-entity rows:  {}", status.sub_entity_rows);
            match (status.min_date, status.max_date) {
                (Some(min), Some(max)) => println!("  Date range:       {min} to {max}"),
                _ => println!("  Date range:       (no data)"),
            }
            match status.last_import {
                Some(last) => println!(
                    "  Last import:      {} at {} ({} rows)",
                    last.source, last.imported_at, last.rows_written
                ),
                None => println!("  Last import:      never"),
            }
        }
    }

    Ok(())
}

fn format_value(registry: &MetricRegistry, metric: &str, value: f64) -> String {
    match registry.spec(metric) {
        Ok(spec) if spec.kind == MetricKind::Integer => format!("{value:.0}"),
        _ => format!("{value:.2}"),
    }
}

fn print_report(registry: &MetricRegistry, report: &DimensionReport) {
    println!();
    match &report.supervisor {
        Some(sup) if report.kind != ReportKind::Team => println!("== {} ({sup}) ==", report.title),
        _ => println!("== {} ==", report.title),
    }
    if let Some(sub) = &report.sub_entity {
        println!("   {} / {sub}", report.key);
    }
    if !report.members.is_empty() {
        println!("   Members: {}", report.members.join(", "));
    }

    let columns = registry.display_order();
    let header: Vec<String> = std::iter::once(format!("{:<14}", "Date"))
        .chain(columns.iter().map(|c| format!("{c:>16}")))
        .collect();
    println!("{}", header.join(""));
    for row in &report.rows {
        let cells: Vec<String> = std::iter::once(format!("{:<14}", row.label()))
            .chain(columns.iter().map(|c| {
                format!("{:>16}", format_value(registry, c, row.values().value(c)))
            }))
            .collect();
        println!("{}", cells.join(""));
    }
}

fn print_comparison(registry: &MetricRegistry, cmp: &Comparison) {
    let Some(latest) = cmp.latest else {
        println!("No data to compare.");
        return;
    };
    println!("Latest: {latest}");
    for group in &cmp.groups {
        println!();
        match group.previous_date {
            Some(prev) => println!("== {} ({} vs {prev}) ==", group.group, group.date),
            None => println!("== {} ({}) ==", group.group, group.date),
        }
        for m in &group.metrics {
            println!(
                "  {:<18}{:>18}  {:>9}",
                m.metric,
                format_value(registry, &m.metric, m.value),
                m.change.to_string()
            );
        }
    }
}
