//! Domain types shared by the archive, staging and query layers.

use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Epoch seconds.
pub type Timestamp = u32;

/// Metric as exposed by the metric index.
///
/// Only leaf metrics (non-empty retention chain) own data points. The chain is
/// ordered from highest to lowest precision.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Stable numeric id
    pub id: u64,
    /// Dotted metric name
    pub name: String,
    /// Retention chain, highest precision first
    pub retention_policies: Vec<Arc<RetentionPolicy>>,
}

impl Metric {
    /// Create a metric.
    pub fn new(id: u64, name: impl Into<String>, policies: Vec<Arc<RetentionPolicy>>) -> Self {
        Self {
            id,
            name: name.into(),
            retention_policies: policies,
        }
    }

    /// Whether this metric may own data points.
    pub fn is_leaf(&self) -> bool {
        !self.retention_policies.is_empty()
    }

    /// Top of the retention chain.
    pub fn highest_precision(&self) -> Option<&Arc<RetentionPolicy>> {
        self.retention_policies.first()
    }

    /// Bottom of the retention chain.
    pub fn coarsest(&self) -> Option<&Arc<RetentionPolicy>> {
        self.retention_policies.last()
    }

    /// Policy following `policy` in the chain, if any.
    pub fn next_lower_resolution(&self, policy: &RetentionPolicy) -> Option<&Arc<RetentionPolicy>> {
        let idx = self
            .retention_policies
            .iter()
            .position(|p| p.as_ref() == policy)?;
        self.retention_policies.get(idx + 1)
    }

    /// Finest policy in this metric's chain covering `[from, until]`.
    pub fn pick_archive_for_query(
        &self,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Option<&Arc<RetentionPolicy>> {
        RetentionPolicy::pick_for_query(&self.retention_policies, from, until, now)
    }
}

/// A single sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Metric name
    pub name: String,
    /// Metric id once resolved against the index
    pub metric_id: Option<u64>,
    /// Sample timestamp
    pub ts: Timestamp,
    /// Sample value
    pub value: f64,
    #[serde(skip)]
    dropped: bool,
}

impl DataPoint {
    /// Create a point that has not been resolved to a metric id yet.
    pub fn new(name: impl Into<String>, value: f64, ts: Timestamp) -> Self {
        Self {
            name: name.into(),
            metric_id: None,
            ts,
            value,
            dropped: false,
        }
    }

    /// Attach a metric id.
    #[must_use]
    pub fn with_metric_id(mut self, id: u64) -> Self {
        self.metric_id = Some(id);
        self
    }

    /// Valid until dropped; NaN samples are never valid.
    pub fn is_valid(&self) -> bool {
        !self.dropped && !self.value.is_nan()
    }

    /// Mark the point as dropped. There is no way back.
    pub fn drop_point(&mut self) {
        self.dropped = true;
    }

    /// Whether the point was dropped.
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// A point together with the metric and tier it was routed to.
#[derive(Debug, Clone)]
pub struct RoutedPoint {
    /// The sample
    pub point: DataPoint,
    /// Resolved metric
    pub metric: Option<Arc<Metric>>,
    /// Tier the point is written into
    pub policy: Option<Arc<RetentionPolicy>>,
}

/// A batch of routed points.
#[derive(Debug, Clone, Default)]
pub struct DataPoints {
    items: Vec<RoutedPoint>,
}

impl DataPoints {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch with capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Add a point routed to `policy` of `metric`.
    pub fn push(
        &mut self,
        mut point: DataPoint,
        metric: Option<Arc<Metric>>,
        policy: Option<Arc<RetentionPolicy>>,
    ) {
        if let Some(m) = &metric {
            point.metric_id = Some(m.id);
        }
        self.items.push(RoutedPoint {
            point,
            metric,
            policy,
        });
    }

    /// Resolve raw points against the index; points of unknown or non-leaf
    /// metrics are dropped, the rest are routed to their highest precision tier.
    pub fn resolve(points: Vec<DataPoint>, index: &dyn crate::core::MetricIndex) -> Self {
        let mut batch = Self::with_capacity(points.len());
        for mut point in points {
            let metric = match point.metric_id {
                Some(id) => index.for_id(id),
                None => index.for_name(&point.name),
            };
            let policy = metric.as_ref().and_then(|m| m.highest_precision().cloned());
            if policy.is_none() {
                point.drop_point();
            }
            batch.push(point, metric, policy);
        }
        batch
    }

    /// Iterate over routed points.
    pub fn iter(&self) -> std::slice::Iter<'_, RoutedPoint> {
        self.items.iter()
    }

    /// Number of points, dropped ones included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no points.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Fixed-step query result. Missing samples are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Metric name
    pub name: String,
    /// First interval, inclusive
    pub start: Timestamp,
    /// Last interval, inclusive
    pub end: Timestamp,
    /// Step between values
    pub step: u32,
    /// One value per step from `start` to `end`
    pub values: Vec<Option<f64>>,
}

impl Series {
    /// Series with every step missing.
    pub fn gaps(name: impl Into<String>, start: Timestamp, end: Timestamp, step: u32) -> Self {
        let count = if end < start || step == 0 {
            0
        } else {
            ((end - start) / step) as usize + 1
        };
        Self {
            name: name.into(),
            start,
            end,
            step,
            values: vec![None; count],
        }
    }

    /// Number of present (non-gap) values.
    pub fn present(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// Outcome of an administrative import into one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResults {
    /// Target tier
    pub db_name: String,
    /// Points submitted
    pub received: usize,
    /// Points written
    pub saved: usize,
    /// Points rejected (misaligned, unknown metric)
    pub errors: usize,
    /// Points outside the tier's retention window
    pub expired: usize,
}
