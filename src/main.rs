use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use maintrack::config::TrackerConfig;
use maintrack::detect::engine::{AnalysisRequest, PatternEngine};
use maintrack::detect::TimeDimension;
use maintrack::model::{EntityKind, IncidentRecord, RunMode, RunStatus, Task};
use maintrack::notify::{notifier_from_config, Dispatcher, Notifier};
use maintrack::analysis::pareto::ParetoDimension;
use maintrack::query::{Metric, MetricQuery, ParetoQuery, QueryService};
use maintrack::scheduler::Schedules;
use maintrack::storage::{SqliteStore, Store};
use maintrack::workflow::Orchestrator;

#[derive(Parser)]
#[command(
    name = "maintrack",
    about = "Repair and maintenance performance analytics for plant mechanics",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $MAINTRACK_CONFIG, then /etc/maintrack/maintrack.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database
    InitDb,

    /// Import incidents or tasks from a JSON array
    Import {
        #[command(subcommand)]
        what: ImportKind,
    },

    /// Run the monitoring workflow once
    Run {
        /// daily, weekly, evaluation or all
        #[arg(long, default_value = "all")]
        mode: RunMode,

        /// Run date (YYYY-MM-DD); defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Detect time-based patterns in closed incidents
    Analyze {
        /// First day of the window (inclusive)
        #[arg(long)]
        start: NaiveDate,

        /// Last day of the window (inclusive)
        #[arg(long)]
        end: NaiveDate,

        /// day_of_week, hour or shift; all dimensions when omitted
        #[arg(long)]
        dimension: Option<TimeDimension>,

        /// Run even if the dimension was analyzed recently
        #[arg(long)]
        force: bool,
    },

    /// Read metrics and task history
    Query {
        #[command(subcommand)]
        what: QueryKind,
    },

    /// Preview scheduled runs for the next N hours
    Schedule {
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Run the cron-driven workflow until interrupted
    Daemon,
}

#[derive(Subcommand)]
enum ImportKind {
    /// Incident records
    Incidents { file: PathBuf },
    /// Monitoring tasks
    Tasks { file: PathBuf },
}

#[derive(Subcommand)]
enum QueryKind {
    /// Per-entity metric aggregates against the team baseline
    Metric {
        /// response_time, repair_time or downtime
        #[arg(long)]
        metric: Metric,

        /// mechanic, machine or line
        #[arg(long, default_value = "mechanic")]
        entity_kind: EntityKind,

        #[arg(long)]
        entity_id: Option<String>,

        #[arg(long)]
        machine_type: Option<String>,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,
    },

    /// Pareto breakdown of incident minutes by machine, reason and more
    Pareto {
        #[arg(long, default_value = "downtime")]
        metric: Metric,

        /// machine, machine_type, reason, line, mechanic or product; repeatable
        #[arg(long = "dimension")]
        dimensions: Vec<ParetoDimension>,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,
    },

    /// Machines failing again shortly after an incident
    Repeats {
        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,

        /// Override breakdown.repeat_window_minutes
        #[arg(long)]
        window_minutes: Option<i64>,
    },

    /// Full history of one task
    Task { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = init_tracing(cli.json_logs);
    let mut config = TrackerConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    logging.apply(&config, cli.json_logs);
    tracing::debug!(
        db = %config.storage.db_path.display(),
        level = %config.logging.level,
        "configuration resolved"
    );

    match cli.command {
        Commands::InitDb => {
            let store = open_store(&config)?;
            tracing::info!(db = %config.storage.db_path.display(), "database ready");
            print_json(&serde_json::json!({
                "db_path": config.storage.db_path,
                "workflow_runs": store.workflow_runs(1)?.len(),
            }))?;
        }
        Commands::Import { what } => {
            let store = open_store(&config)?;
            let imported = match what {
                ImportKind::Incidents { file } => {
                    let records: Vec<IncidentRecord> = read_json(&file)?;
                    for record in &records {
                        store.insert_incident(record)?;
                    }
                    records.len()
                }
                ImportKind::Tasks { file } => {
                    let tasks: Vec<Task> = read_json(&file)?;
                    for task in &tasks {
                        store.insert_task(task)?;
                    }
                    tasks.len()
                }
            };
            tracing::info!(imported, "import complete");
            print_json(&serde_json::json!({ "imported": imported }))?;
        }
        Commands::Run { mode, date } => {
            let store = open_store(&config)?;
            let notifier = build_notifier(&config)?;
            let orchestrator = Orchestrator::new(store, &config, notifier);
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = orchestrator.run(mode, date).await;
            print_json(&summary)?;
            if summary.status == RunStatus::Failed {
                anyhow::bail!(
                    "run {} aborted: {}",
                    summary.run_id,
                    summary.abort_reason.unwrap_or_default()
                );
            }
        }
        Commands::Analyze {
            start,
            end,
            dimension,
            force,
        } => {
            let store = open_store(&config)?;
            let notifier = build_notifier(&config)?;
            let dispatcher = Dispatcher::new(
                store.clone(),
                notifier,
                &config.notifications,
                config.evaluation.max_extensions,
            );
            let engine = PatternEngine::new(store, &config, dispatcher);
            let mut request = AnalysisRequest::new(start, end);
            request.dimension = dimension;
            request.force = force;
            let report = engine.run(&request).await?;
            print_json(&report)?;
        }
        Commands::Query { what } => {
            let store = open_store(&config)?;
            let service = QueryService::new(store, &config);
            match what {
                QueryKind::Metric {
                    metric,
                    entity_kind,
                    entity_id,
                    machine_type,
                    reason,
                    start,
                    end,
                } => {
                    let report = service.metric_report(&MetricQuery {
                        metric,
                        entity_kind,
                        entity_id,
                        machine_type,
                        reason,
                        start,
                        end,
                    })?;
                    print_json(&report)?;
                }
                QueryKind::Pareto {
                    metric,
                    dimensions,
                    start,
                    end,
                } => {
                    let report = service.pareto_report(&ParetoQuery {
                        metric,
                        dimensions,
                        start,
                        end,
                    })?;
                    print_json(&report)?;
                }
                QueryKind::Repeats {
                    start,
                    end,
                    window_minutes,
                } => print_json(&service.repeat_report(start, end, window_minutes)?)?,
                QueryKind::Task { id } => print_json(&service.task_history(id)?)?,
            }
        }
        Commands::Schedule { hours } => {
            let schedules = Schedules::from_config(&config.schedule)?;
            let preview: Vec<serde_json::Value> = schedules
                .preview(Utc::now(), hours)
                .into_iter()
                .map(|(at, mode)| serde_json::json!({ "at": at, "mode": mode }))
                .collect();
            print_json(&preview)?;
        }
        Commands::Daemon => {
            let store = open_store(&config)?;
            tracing::info!(db = %config.storage.db_path.display(), "starting maintrack daemon");
            maintrack::serve(&config, store).await?;
        }
    }

    Ok(())
}

type BaseSubscriber = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type OutputLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Reload handles for the subscriber installed before the config is read.
struct LoggingHandles {
    filter: reload::Handle<EnvFilter, Registry>,
    output: reload::Handle<OutputLayer, BaseSubscriber>,
}

impl LoggingHandles {
    /// Switch to the configured level and format. `RUST_LOG` and
    /// `--json-logs` win over the config file.
    fn apply(&self, config: &TrackerConfig, json_flag: bool) {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
            if let Err(e) = self.filter.reload(EnvFilter::new(&config.logging.level)) {
                tracing::warn!(error = %e, "failed to apply configured log level");
            }
        }
        if config.logging.json && !json_flag {
            if let Err(e) = self.output.reload(output_layer(true)) {
                tracing::warn!(error = %e, "failed to switch to JSON logs");
            }
        }
    }
}

fn output_layer(json: bool) -> OutputLayer {
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn init_tracing(json: bool) -> LoggingHandles {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, filter_handle) = reload::Layer::new(filter);
    let (output, output_handle) = reload::Layer::new(output_layer(json));
    tracing_subscriber::registry().with(filter).with(output).init();
    LoggingHandles {
        filter: filter_handle,
        output: output_handle,
    }
}

fn open_store(config: &TrackerConfig) -> Result<Arc<dyn Store>> {
    let store = SqliteStore::open(&config.storage).with_context(|| {
        format!(
            "failed to open database at {}",
            config.storage.db_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn build_notifier(config: &TrackerConfig) -> Result<Arc<dyn Notifier>> {
    let notifier = notifier_from_config(&config.notifications).context("failed to build notifier")?;
    Ok(Arc::from(notifier))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
