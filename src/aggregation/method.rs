//! Reductions applied when many raw values collapse into one interval.

use crate::core::{Result, TierError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a group of raw values becomes one downsampled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Arithmetic mean
    Avg,
    /// Total
    Sum,
    /// Smallest value
    Min,
    /// Largest value
    Max,
    /// Last value in grouped order
    Last,
    /// Mean for names ending in `mean`, `p95`, `min` or `max`, sum otherwise
    BySuffix,
}

const AVERAGED_SUFFIXES: [&str; 4] = ["mean", "p95", "min", "max"];

impl AggregationMethod {
    /// Reduce `values`; `None` when there is nothing to reduce.
    pub fn reduce(self, metric_name: &str, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let value = match self {
            Self::Avg => sum(values) / values.len() as f64,
            Self::Sum => sum(values),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Last => *values.last()?,
            Self::BySuffix => return self.resolve(metric_name).reduce(metric_name, values),
        };
        Some(value)
    }

    /// Concrete method for `metric_name`; only differs for [`Self::BySuffix`].
    pub fn resolve(self, metric_name: &str) -> Self {
        match self {
            Self::BySuffix if AVERAGED_SUFFIXES.iter().any(|s| metric_name.ends_with(s)) => {
                Self::Avg
            },
            Self::BySuffix => Self::Sum,
            other => other,
        }
    }

    /// Lowercase name used in rule files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Last => "last",
            Self::BySuffix => "bysuffix",
        }
    }
}

fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

impl FromStr for AggregationMethod {
    type Err = TierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avg" | "average" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "last" => Ok(Self::Last),
            "bysuffix" | "custom1" => Ok(Self::BySuffix),
            other => Err(TierError::config(format!("unknown aggregation method {other:?}"))),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
