//! Per-batch and per-query timing.

use quantiles::ckms::CKMS;
use std::time::Duration;

/// Running count/sum/min/max of millisecond samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl Summary {
    /// Record one sample.
    pub fn accept(&mut self, millis: u64) {
        if self.count == 0 {
            self.min = millis;
            self.max = millis;
        } else {
            self.min = self.min.min(millis);
            self.max = self.max.max(millis);
        }
        self.count += 1;
        self.sum += millis;
    }

    /// Record a duration sample.
    pub fn accept_duration(&mut self, elapsed: Duration) {
        self.accept(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    }

    /// Fold another summary into this one.
    pub fn combine(&mut self, other: &Summary) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Mean sample, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// What one batch task did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    /// Time between submission and start.
    pub wait: Duration,
    pub series: usize,
    pub points: usize,
    /// Metrics whose read failed.
    pub errors: usize,
    /// Series not written because the output stream broke.
    pub unsent: usize,
    pub read: Summary,
    pub empty_read: Summary,
    pub send: Summary,
}

/// Aggregated statistics of one query.
#[derive(Debug, Clone)]
pub struct QueryStats {
    /// Served by the heavy pool.
    pub heavy: bool,
    pub batches: usize,
    pub series: usize,
    pub points: usize,
    pub errors: usize,
    pub unsent: usize,
    pub wait: Summary,
    pub read: Summary,
    pub empty_read: Summary,
    pub send: Summary,
    wait_quantiles: CKMS<f64>,
}

impl QueryStats {
    /// Empty statistics.
    pub fn new(heavy: bool) -> Self {
        Self {
            heavy,
            batches: 0,
            series: 0,
            points: 0,
            errors: 0,
            unsent: 0,
            wait: Summary::default(),
            read: Summary::default(),
            empty_read: Summary::default(),
            send: Summary::default(),
            wait_quantiles: CKMS::new(0.001),
        }
    }

    /// Fold in a finished batch.
    pub fn accept(&mut self, batch: &BatchStats) {
        self.batches += 1;
        self.series += batch.series;
        self.points += batch.points;
        self.errors += batch.errors;
        self.unsent += batch.unsent;
        self.wait.accept_duration(batch.wait);
        self.read.combine(&batch.read);
        self.empty_read.combine(&batch.empty_read);
        self.send.combine(&batch.send);
        self.wait_quantiles.insert(batch.wait.as_secs_f64() * 1000.0);
    }

    /// Approximate batch queue wait in milliseconds at quantile `q`.
    pub fn wait_quantile(&self, q: f64) -> Option<f64> {
        self.wait_quantiles.query(q).map(|(_, v)| v)
    }
}
