use thiserror::Error;

#[derive(Error, Debug)]
pub enum TierError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timestamp {ts} is not aligned to {precision}s precision of policy {policy}")]
    IntervalMismatch {
        ts: u32,
        precision: u32,
        policy: String,
    },

    #[error("Query would return too many data points, limit is {limit}")]
    TooManyDataPoints { limit: u64 },

    #[error("Unknown retention policy: {0}")]
    UnknownPolicy(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Import into {db_name} failed: {errors} errors exceed the allowed {max_allowed}")]
    ImportErrorBudgetExceeded {
        db_name: String,
        errors: usize,
        max_allowed: usize,
    },

    #[error("Query {pattern} [{from}, {until}] failed after {elapsed_ms}ms: {reason}")]
    QueryFailed {
        pattern: String,
        from: u32,
        until: u32,
        elapsed_ms: u64,
        reason: String,
    },

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Component is shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Result type alias for storage engine operations
pub type Result<T> = std::result::Result<T, TierError>;

impl TierError {
    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new staging error
    pub fn staging<S: Into<String>>(msg: S) -> Self {
        Self::Staging(msg.into())
    }

    /// Creates a new corrupt-record error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Creates a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Returns true if this error only affects a single point or record
    /// and the surrounding unit of work may continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IntervalMismatch { .. }
                | Self::UnknownMetric(_)
                | Self::Corrupt(_)
                | Self::Parse { .. }
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Config(_) | Self::UnknownPolicy(_) => "config",
            Self::IntervalMismatch { .. } | Self::UnknownMetric(_) => "validation",
            Self::TooManyDataPoints { .. } => "admission",
            Self::ImportErrorBudgetExceeded { .. } => "import",
            Self::QueryFailed { .. } => "query",
            Self::Staging(_) => "staging",
            Self::Corrupt(_) | Self::Parse { .. } => "corruption",
            Self::Cancelled | Self::Shutdown => "lifecycle",
            Self::Io(_) => "io",
            Self::Serialization(_) | Self::Yaml(_) | Self::Encoding(_) => "serialization",
        }
    }
}
