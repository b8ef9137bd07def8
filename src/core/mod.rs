//! Core domain models and ambient infrastructure.
//!
//! This module contains the error type, configuration, the time source and
//! the types shared between the archive, staging and query layers.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, EngineKind};
pub use error::{Result, TierError};
pub use index::{InMemoryMetricIndex, MetricIndex};
pub use types::{DataPoint, DataPoints, ImportResults, Metric, RoutedPoint, Series, Timestamp};
