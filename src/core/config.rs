//! Configuration management for tierdb.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - CLI argument overrides
//! - Validation and defaults

use crate::core::{Result, TierError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for the storage engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Archive configuration
    pub storage: StorageConfig,
    /// Staging pipeline configuration
    pub staging: StagingConfig,
    /// Query scheduling configuration
    pub query: QueryConfig,
    /// Iterator/batch disposal configuration
    pub disposal: DisposalConfig,
    /// Aggregation rules configuration
    pub aggregation: AggregationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Key-value engine backing each archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Built-in ordered map with an append-only batch log
    Log,
    /// RocksDB with TTL (requires the `persistent` feature)
    Rocksdb,
}

/// Archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory, one sub-directory per tier
    pub data_dir: PathBuf,
    /// Retention chain, highest precision first
    pub retention: Vec<String>,
    /// Use 8-byte metric ids in archive keys
    pub long_id: bool,
    /// Stage points into lower-resolution tiers on insert
    pub update_lower_resolution_archives: bool,
    /// Sync the batch log after every write
    pub sync_writes: bool,
    /// How often TTL compaction runs in daemon mode
    #[serde(with = "humantime_serde")]
    pub compaction_interval: Duration,
    /// Engine implementation
    pub engine: EngineKind,
}

/// Staging pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Directory for staging files, defaults to `<data_dir>/staging`
    pub dir: Option<PathBuf>,
    /// Intake queue capacity; points beyond it are dropped
    pub queue_size: usize,
    /// Records drained per writer pass
    pub batch_size: usize,
    /// Number of shards per interval bucket
    pub shards: u32,
    /// Writer idle pause when the intake queue is empty
    #[serde(with = "humantime_serde")]
    pub empty_queue_pause: Duration,
    /// Period of the collect/sort/aggregate job
    #[serde(with = "humantime_serde")]
    pub propagate_interval: Duration,
    /// Threads used to sort and group collected file-sets
    pub propagate_threads: usize,
    /// Period of the stale file cleanup job
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Files older than this and not open are deleted by cleanup
    #[serde(with = "humantime_serde")]
    pub max_file_age: Duration,
    /// Idle threshold overrides keyed by tier db name
    #[serde(with = "humantime_map")]
    pub collect_idle: HashMap<String, Duration>,
    /// Records held in memory per sort run
    pub sort_chunk_records: usize,
    /// Capacity of each tier's interval queue
    pub intervals_queue_size: usize,
    /// Aggregator threads per tier
    pub interval_consumers: usize,
    /// Interval values handed to one aggregation task
    pub interval_batch_size: usize,
}

/// Query scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Light executor threads
    pub light_threads: usize,
    /// Light executor backlog
    pub light_queue: usize,
    /// Heavy executor threads
    pub heavy_threads: usize,
    /// Heavy executor backlog
    pub heavy_queue: usize,
    /// Metrics per read task
    pub batch_size: usize,
    /// Hard ceiling on estimated points per request
    pub max_points_per_request: u64,
    /// Estimated points above which a query is heavy
    pub heavy_query_threshold: u64,
    /// Log queries slower than this
    #[serde(with = "humantime_serde")]
    pub log_response_time: Duration,
    /// Log queries returning more series than this
    pub log_series_count: usize,
    /// Series cache capacity
    pub cache_max_size: usize,
    /// Series cache entry lifetime
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Tier db names whose reads are cached
    pub cache_tiers: Vec<String>,
}

/// Disposal queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisposalConfig {
    /// Pending handles before new ones are discarded
    pub queue_size: usize,
}

/// Aggregation rules configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Inline rules, `method = regex` per entry
    pub rules: Vec<String>,
    /// Optional rules file, reloaded when modified
    pub rules_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./data"),
            retention: vec!["60s:24h".into(), "5m:7d".into(), "30m:2y".into()],
            long_id: false,
            update_lower_resolution_archives: true,
            sync_writes: false,
            compaction_interval: Duration::from_secs(600),
            engine: EngineKind::Log,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            dir: None,
            queue_size: 1_000_000,
            batch_size: 10_000,
            shards: 4,
            empty_queue_pause: Duration::from_millis(100),
            propagate_interval: Duration::from_secs(30 * 60),
            propagate_threads: 3,
            cleanup_interval: Duration::from_secs(5 * 60),
            max_file_age: Duration::from_secs(120 * 60),
            collect_idle: HashMap::new(),
            sort_chunk_records: 500_000,
            intervals_queue_size: 10_000,
            interval_consumers: 1,
            interval_batch_size: 10_000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            light_threads: 20,
            light_queue: 100,
            heavy_threads: 5,
            heavy_queue: 10,
            batch_size: 100,
            max_points_per_request: 20_000_000,
            heavy_query_threshold: 10_000 * 24 * 60,
            log_response_time: Duration::from_secs(5),
            log_series_count: 5_000,
            cache_max_size: 100_000,
            cache_ttl: Duration::from_secs(30),
            cache_tiers: vec!["60s24h".into(), "60s30d".into()],
        }
    }
}

impl Default for DisposalConfig {
    fn default() -> Self {
        DisposalConfig {
            queue_size: 100_000,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            rules: vec!["avg = *".into()],
            rules_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.retention.is_empty() {
            return Err(TierError::config("at least one retention policy is required"));
        }

        #[cfg(not(feature = "persistent"))]
        if self.storage.engine == EngineKind::Rocksdb {
            return Err(TierError::config(
                "rocksdb engine requires building with the `persistent` feature",
            ));
        }

        if self.staging.queue_size == 0 || self.staging.batch_size == 0 {
            return Err(TierError::config(
                "staging queue_size and batch_size must be greater than 0",
            ));
        }

        if self.staging.shards == 0 {
            return Err(TierError::config("staging shards must be greater than 0"));
        }

        if self.staging.propagate_threads == 0 || self.staging.interval_consumers == 0 {
            return Err(TierError::config(
                "propagate_threads and interval_consumers must be greater than 0",
            ));
        }

        if self.query.light_threads == 0 || self.query.heavy_threads == 0 {
            return Err(TierError::config("query pools need at least one thread"));
        }

        if self.query.batch_size == 0 {
            return Err(TierError::config("query batch_size must be greater than 0"));
        }

        if self.query.heavy_query_threshold > self.query.max_points_per_request {
            return Err(TierError::config(format!(
                "heavy_query_threshold {} exceeds max_points_per_request {}",
                self.query.heavy_query_threshold, self.query.max_points_per_request
            )));
        }

        if self.disposal.queue_size == 0 {
            return Err(TierError::config("disposal queue_size must be greater than 0"));
        }

        Ok(())
    }

    /// Directory holding staging files
    pub fn staging_dir(&self) -> PathBuf {
        self.staging
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("staging"))
    }

    /// Directory holding one tier's archive
    pub fn archive_dir(&self, db_name: &str) -> PathBuf {
        self.storage.data_dir.join(db_name)
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| TierError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set data directory
    pub fn data_dir(mut self, path: PathBuf) -> Self {
        self.config.storage.data_dir = path;
        self
    }

    /// Set the retention chain
    pub fn retention<I, S>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.storage.retention = policies.into_iter().map(Into::into).collect();
        self
    }

    /// Use 8-byte metric ids
    pub fn long_id(mut self, enable: bool) -> Self {
        self.config.storage.long_id = enable;
        self
    }

    /// Enable staging into lower-resolution tiers
    pub fn propagate(mut self, enable: bool) -> Self {
        self.config.storage.update_lower_resolution_archives = enable;
        self
    }

    /// Set the staging shard count
    pub fn staging_shards(mut self, shards: u32) -> Self {
        self.config.staging.shards = shards;
        self
    }

    /// Set the staging intake queue size
    pub fn staging_queue_size(mut self, size: usize) -> Self {
        self.config.staging.queue_size = size;
        self
    }

    /// Set the point ceiling and heavy threshold
    pub fn query_limits(mut self, max_points: u64, heavy_threshold: u64) -> Self {
        self.config.query.max_points_per_request = max_points;
        self.config.query.heavy_query_threshold = heavy_threshold;
        self
    }

    /// Set the aggregation rules
    pub fn aggregation_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.aggregation.rules = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// `humantime_serde` for map values.
mod humantime_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Human(#[serde(with = "humantime_serde")] Duration);

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let human: HashMap<&String, Human> = map.iter().map(|(k, v)| (k, Human(*v))).collect();
        human.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let human = HashMap::<String, Human>::deserialize(deserializer)?;
        Ok(human.into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}
