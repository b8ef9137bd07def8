//! Administrative command line for tierdb.
//!
//! Every command opens the store described by the configuration, does its
//! work and closes it again; `serve` keeps the background schedules running
//! until Ctrl-C.

use crate::aggregation::{AggregationPolicySource, RulesWatcher};
use crate::core::config::ConfigBuilder;
use crate::core::{Config, DataPoint, InMemoryMetricIndex, Result, TierError, Timestamp};
use crate::query::{JsonLinesSink, Query, QueryScheduler, SeriesReader, SeriesSink};
use crate::retention::{parse_span, PolicyRegistry};
use crate::storage::Store;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INDEX_FILE: &str = "metrics.idx";

/// Tiered Graphite-style time-series storage
#[derive(Parser, Debug)]
#[command(name = "tierdb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/tierdb/config.yaml)
    #[arg(short, long, global = true, env = "TIERDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true, env = "TIERDB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, env = "TIERDB_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Administrative commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate configuration and exit
    CheckConfig,

    /// Load `name timestamp value` lines straight into one tier
    Import {
        /// Tier archive name, e.g. 5m7d
        db_name: String,
        /// Input file
        file: PathBuf,
        /// Give up once more points than this failed
        #[arg(long, default_value = "0")]
        max_errors: usize,
    },

    /// Print matching series as JSON lines
    Fetch {
        /// Metric pattern; `*` matches within one segment
        pattern: String,
        /// Epoch seconds, RFC 3339, `now` or `-<span>` such as `-1h`
        #[arg(long, default_value = "-1h")]
        from: String,
        /// Same formats as --from
        #[arg(long, default_value = "now")]
        until: String,
    },

    /// Delete every point at one interval of a tier
    DeleteInterval {
        /// Tier archive name
        db_name: String,
        /// Any timestamp inside the interval
        ts: String,
    },

    /// Aggregate staged points into the lower tiers now
    Propagate {
        /// Collect intervals that are still receiving points
        #[arg(long)]
        force: bool,
    },

    /// Run staging and compaction schedules until interrupted
    Serve,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration: config file, then command line overrides.
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = match &self.config {
            Some(path) => Some(path.clone()),
            None => dirs::config_dir()
                .map(|d| d.join("tierdb").join("config.yaml"))
                .filter(|p| p.exists()),
        };

        if let Some(path) = config_path {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::info!("Loaded configuration from: {:?}", path);
                },
                Err(e) if self.config.is_some() => {
                    return Err(TierError::config(format!(
                        "Failed to read config file {:?}: {}",
                        path, e
                    )));
                },
                Err(_) => {
                    tracing::debug!("No config file found at {:?}, using defaults", path);
                },
            }
        }

        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir.clone());
        }
        builder.debug(self.debug).build()
    }

    /// Initialize logging from `TIERDB_LOG`, `RUST_LOG`, `--debug` or the
    /// configured level, in that order.
    pub fn init_logging(&self, configured: &str) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let level = if self.debug { "debug" } else { configured };
        let filter = EnvFilter::try_from_env("TIERDB_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(level));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(self.debug)
            .with_thread_ids(matches!(self.command, Command::Serve))
            .with_writer(std::io::stderr)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TierError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Parse a command line time relative to `now`.
pub fn parse_time(input: &str, now: Timestamp) -> Result<Timestamp> {
    let input = input.trim();
    if input == "now" {
        return Ok(now);
    }
    if let Some(span) = input.strip_prefix('-') {
        return Ok(now.saturating_sub(parse_span(span)?));
    }
    if let Ok(ts) = input.parse::<Timestamp>() {
        return Ok(ts);
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(input)
        .map_err(|e| TierError::parse(format!("invalid time {input:?}: {e}")))?;
    Timestamp::try_from(parsed.timestamp())
        .map_err(|_| TierError::parse(format!("time {input:?} is out of range")))
}

/// Parse one `name timestamp value` import line.
pub fn parse_import_line(line: &str) -> Result<DataPoint> {
    let mut fields = line.split_whitespace();
    let (Some(name), Some(ts), Some(value), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(TierError::parse(format!("expected `name timestamp value`: {line:?}")));
    };
    let ts = ts
        .parse::<Timestamp>()
        .map_err(|e| TierError::parse(format!("bad timestamp in {line:?}: {e}")))?;
    let value = value
        .parse::<f64>()
        .map_err(|e| TierError::parse(format!("bad value in {line:?}: {e}")))?;
    Ok(DataPoint::new(name, value, ts))
}

/// Execute the parsed command.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;
    cli.init_logging(config.logging.level.as_str())?;
    tracing::debug!("Configuration: {:?}", config);

    match cli.command {
        Command::CheckConfig => {
            check_config(&config);
            Ok(())
        },
        Command::Serve => serve(config).await,
        command => run_blocking(move || run_command(&config, command)).await,
    }
}

fn check_config(config: &Config) {
    println!("Configuration is valid!");
    println!("  Data dir: {:?}", config.storage.data_dir);
    println!("  Retention: {}", config.storage.retention.join(", "));
    println!("  Engine: {:?}", config.storage.engine);
    println!(
        "  Propagation: {}",
        if config.storage.update_lower_resolution_archives { "on" } else { "off" }
    );
    println!("  Staging dir: {:?}", config.staging_dir());
    println!(
        "  Query limits: {} points, heavy above {}",
        config.query.max_points_per_request, config.query.heavy_query_threshold
    );
}

async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TierError::storage(format!("command task failed: {e}")))?
}

/// Store and name index opened from `config`.
struct Opened {
    store: Arc<Store>,
    index: Arc<InMemoryMetricIndex>,
    registry: Arc<PolicyRegistry>,
    index_path: PathBuf,
}

fn open(config: &Config, aggregation: Option<Arc<AggregationPolicySource>>) -> Result<Opened> {
    let registry = Arc::new(PolicyRegistry::with_chain(&config.storage.retention)?);
    let index_path = config.storage.data_dir.join(INDEX_FILE);
    std::fs::create_dir_all(&config.storage.data_dir)?;
    let index = Arc::new(InMemoryMetricIndex::load(
        &index_path,
        registry.chain(&config.storage.retention.join(","))?,
    )?);
    let mut builder = Store::builder(config.clone())
        .registry(Arc::clone(&registry))
        .index(Arc::clone(&index) as Arc<dyn crate::core::MetricIndex>);
    if let Some(source) = aggregation {
        builder = builder.aggregation(source);
    }
    Ok(Opened {
        store: builder.open()?,
        index,
        registry,
        index_path,
    })
}

fn run_command(config: &Config, command: Command) -> Result<()> {
    let opened = open(config, None)?;
    let result = match command {
        Command::Import {
            db_name,
            file,
            max_errors,
        } => import(&opened, &db_name, &file, max_errors),
        Command::Fetch {
            pattern,
            from,
            until,
        } => fetch(config, &opened, &pattern, &from, &until),
        Command::DeleteInterval { db_name, ts } => {
            let ts = parse_time(&ts, opened.store.now())?;
            let deleted = opened.store.delete(&db_name, ts)?;
            println!("Deleted {} points from {}", deleted, db_name);
            Ok(())
        },
        Command::Propagate { force } => {
            let files = opened.store.propagate(force)?;
            println!("Propagated {} staging files", files);
            Ok(())
        },
        Command::CheckConfig | Command::Serve => Ok(()),
    };
    opened.store.dump_stats();
    opened.store.close();
    result
}

fn import(opened: &Opened, db_name: &str, file: &Path, max_errors: usize) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let mut points = Vec::new();
    let mut malformed = 0usize;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match parse_import_line(line) {
            Ok(point) => {
                let metric = opened.index.get_or_create(&point.name)?;
                points.push(point.with_metric_id(metric.id));
            },
            Err(e) => {
                malformed += 1;
                tracing::warn!("Skipping line: {}", e);
                if malformed > max_errors {
                    return Err(TierError::ImportErrorBudgetExceeded {
                        db_name: db_name.to_string(),
                        errors: malformed,
                        max_allowed: max_errors,
                    });
                }
            },
        }
    }

    let budget = max_errors - malformed;
    let mut results = opened.store.import_points(db_name, &points, budget)?;
    results.received += malformed;
    results.errors += malformed;
    opened.index.save(&opened.index_path)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn fetch(config: &Config, opened: &Opened, pattern: &str, from: &str, until: &str) -> Result<()> {
    let now = opened.store.now();
    let query = Query::new(pattern, parse_time(from, now)?, parse_time(until, now)?, now);
    let scheduler = QueryScheduler::new(
        &config.query,
        Arc::clone(&opened.store) as Arc<dyn SeriesReader>,
        Arc::clone(&opened.index) as Arc<dyn crate::core::MetricIndex>,
        Arc::clone(&opened.registry),
    )?;
    let sink: Arc<dyn SeriesSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let stats = scheduler.stream_series(&query, sink);
    scheduler.shutdown();
    let stats = stats?;
    tracing::info!(
        "Fetched {} series ({} points, {} errors) for {}",
        stats.series,
        stats.points,
        stats.errors,
        pattern
    );
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let source = Arc::new(AggregationPolicySource::from_lines(&config.aggregation.rules)?);
    if let Some(path) = &config.aggregation.rules_file {
        source.reload_file(path)?;
    }
    let opened = open(&config, Some(Arc::clone(&source)))?;
    opened.store.start_maintenance()?;

    let watcher = config.aggregation.rules_file.clone().map(|path| {
        tokio::spawn(async move {
            if let Err(e) = RulesWatcher::new(path, source).watch().await {
                tracing::error!("Rules watcher stopped: {}", e);
            }
        })
    });

    tracing::info!("tierdb serving data dir {:?}", config.storage.data_dir);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    if let Some(handle) = watcher {
        handle.abort();
    }
    let store = Arc::clone(&opened.store);
    run_blocking(move || {
        store.dump_stats();
        store.close();
        Ok(())
    })
    .await?;
    opened.index.save(&opened.index_path)
}
