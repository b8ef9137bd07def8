//! Admission control and batched dispatch of series reads.
//!
//! A query is costed before any read happens: the tier that would serve the
//! window bounds the points per metric. Queries above the hard ceiling are
//! rejected; the rest go to the light or the heavy pool in fixed size batches.

use super::executor::{BoundedExecutor, ExecutorStats, TaskHandle};
use super::sink::SeriesSink;
use super::stats::{BatchStats, QueryStats};
use crate::core::config::QueryConfig;
use crate::core::{Metric, MetricIndex, Result, Series, TierError, Timestamp};
use crate::retention::PolicyRegistry;
use crate::storage::Store;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Anything that can produce the series of one metric.
pub trait SeriesReader: Send + Sync {
    /// Series of `metric` over `[from, until]` as of `now`.
    fn read_series(
        &self,
        metric: &Metric,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Series>;
}

impl SeriesReader for Store {
    fn read_series(
        &self,
        metric: &Metric,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Series> {
        self.get_series(metric, from, until, now)
    }
}

/// A series request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub pattern: String,
    pub from: Timestamp,
    pub until: Timestamp,
    pub now: Timestamp,
}

impl Query {
    /// Query for `pattern` over `[from, until]` as of `now`.
    pub fn new(
        pattern: impl Into<String>,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            from,
            until,
            now,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    light: AtomicU64,
    heavy: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Scheduler statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub light_queries: u64,
    pub heavy_queries: u64,
    pub rejected: u64,
    pub failed: u64,
    pub light_pool: ExecutorStats,
    pub heavy_pool: ExecutorStats,
}

/// Routes series queries to the light and heavy pools.
pub struct QueryScheduler {
    reader: Arc<dyn SeriesReader>,
    index: Arc<dyn MetricIndex>,
    registry: Arc<PolicyRegistry>,
    light: BoundedExecutor,
    heavy: BoundedExecutor,
    batch_size: usize,
    max_points: u64,
    heavy_threshold: u64,
    log_response_time: Duration,
    log_series_count: usize,
    counters: Counters,
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryScheduler")
            .field("batch_size", &self.batch_size)
            .field("max_points", &self.max_points)
            .field("heavy_threshold", &self.heavy_threshold)
            .finish_non_exhaustive()
    }
}

impl QueryScheduler {
    /// Start both pools.
    pub fn new(
        config: &QueryConfig,
        reader: Arc<dyn SeriesReader>,
        index: Arc<dyn MetricIndex>,
        registry: Arc<PolicyRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            reader,
            index,
            registry,
            light: BoundedExecutor::new("tierdb-query", config.light_threads, config.light_queue)?,
            heavy: BoundedExecutor::new(
                "tierdb-heavy-query",
                config.heavy_threads,
                config.heavy_queue,
            )?,
            batch_size: config.batch_size.max(1),
            max_points: config.max_points_per_request,
            heavy_threshold: config.heavy_query_threshold,
            log_response_time: config.log_response_time,
            log_series_count: config.log_series_count,
            counters: Counters::default(),
        })
    }

    /// Upper bound of points `query` returns for `metrics` series.
    ///
    /// Without a tier covering the window the query is treated as heavy.
    pub fn estimate_points(&self, query: &Query, metrics: usize) -> u64 {
        match self
            .registry
            .pick_archive_for_query(query.from, query.until, query.now)
        {
            Some(policy) => policy
                .max_points(query.from, query.until, query.now)
                .saturating_mul(metrics as u64),
            None => self.heavy_threshold.saturating_add(1),
        }
    }

    fn admit(&self, query: &Query, metrics: usize) -> Result<bool> {
        let estimate = self.estimate_points(query, metrics);
        if estimate > self.max_points {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Rejected query {} [{}, {}]: ~{} points over {} series",
                query.pattern,
                query.from,
                query.until,
                estimate,
                metrics
            );
            return Err(TierError::TooManyDataPoints {
                limit: self.max_points,
            });
        }
        let heavy = estimate > self.heavy_threshold;
        if heavy {
            self.counters.heavy.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.light.fetch_add(1, Ordering::Relaxed);
        }
        Ok(heavy)
    }

    fn leaf_metrics(&self, pattern: &str) -> Vec<Arc<Metric>> {
        let mut metrics = self.index.find_metrics(pattern);
        metrics.retain(|m| m.is_leaf());
        metrics
    }

    /// Submit one task per batch of metrics and wait for all of them.
    ///
    /// The first failed batch cancels the ones not started yet and fails the
    /// whole query.
    fn run_batches<T, F>(
        &self,
        query: &Query,
        metrics: &[Arc<Metric>],
        heavy: bool,
        started: Instant,
        make_task: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Vec<Arc<Metric>>, Instant) -> Box<dyn FnOnce() -> T + Send>,
    {
        let pool = if heavy { &self.heavy } else { &self.light };
        let mut handles: Vec<TaskHandle<T>> = Vec::new();
        for batch in metrics.chunks(self.batch_size) {
            match pool.submit(make_task(batch.to_vec(), Instant::now())) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    handles.iter().for_each(TaskHandle::cancel);
                    return Err(self.failed(query, started, e.to_string()));
                },
            }
        }
        tracing::debug!(
            "Query {} dispatched {} batches to the {} pool",
            query.pattern,
            handles.len(),
            pool.name()
        );

        let mut results = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter();
        while let Some(handle) = pending.next() {
            match handle.join() {
                Ok(value) => results.push(value),
                Err(failure) => {
                    pending.by_ref().for_each(|h| h.cancel());
                    return Err(self.failed(query, started, failure.to_string()));
                },
            }
        }
        Ok(results)
    }

    fn failed(&self, query: &Query, started: Instant, reason: String) -> TierError {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::error!(
            "Query {} [{}, {}] failed after {}ms: {}",
            query.pattern,
            query.from,
            query.until,
            elapsed_ms,
            reason
        );
        TierError::QueryFailed {
            pattern: query.pattern.clone(),
            from: query.from,
            until: query.until,
            elapsed_ms,
            reason,
        }
    }

    /// Stream every matching series into `sink` as batches complete.
    ///
    /// Per-metric read errors are counted and skipped. Once `sink` fails no
    /// further series are written, but reads still run to completion.
    pub fn stream_series(&self, query: &Query, sink: Arc<dyn SeriesSink>) -> Result<QueryStats> {
        let started = Instant::now();
        let metrics = self.leaf_metrics(&query.pattern);
        let heavy = self.admit(query, metrics.len())?;
        sink.open()?;

        let broken = Arc::new(AtomicBool::new(false));
        let result = self.run_batches(query, &metrics, heavy, started, |batch, submitted| {
            let reader = Arc::clone(&self.reader);
            let sink = Arc::clone(&sink);
            let broken = Arc::clone(&broken);
            let query = query.clone();
            Box::new(move || {
                stream_batch(reader.as_ref(), &batch, &query, sink.as_ref(), &broken, submitted)
            })
        });
        if let Err(e) = sink.close() {
            tracing::error!("Failed to close response stream: {}", e);
        }

        let mut stats = QueryStats::new(heavy);
        for batch in &result? {
            stats.accept(batch);
        }
        self.log_completed(query, started, &stats);
        Ok(stats)
    }

    /// Collect every matching series, in metric name order.
    pub fn fetch_series(&self, query: &Query) -> Result<Vec<Series>> {
        let started = Instant::now();
        let metrics = self.leaf_metrics(&query.pattern);
        let heavy = self.admit(query, metrics.len())?;
        let batches = self.run_batches(query, &metrics, heavy, started, |batch, _| {
            let reader = Arc::clone(&self.reader);
            let query = query.clone();
            Box::new(move || {
                batch
                    .iter()
                    .filter_map(|m| read_quietly(reader.as_ref(), m, &query))
                    .collect::<Vec<_>>()
            })
        })?;
        Ok(batches.into_iter().flatten().collect())
    }

    fn log_completed(&self, query: &Query, started: Instant, stats: &QueryStats) {
        let elapsed = started.elapsed();
        if elapsed <= self.log_response_time && stats.series <= self.log_series_count {
            return;
        }
        tracing::info!(
            "Query {} [{}, {}] took {:?}: {} series, {} points, {} errors, heavy={}, \
             wait p99 {:?}ms, read {}ms, send {}ms",
            query.pattern,
            query.from,
            query.until,
            elapsed,
            stats.series,
            stats.points,
            stats.errors,
            stats.heavy,
            stats.wait_quantile(0.99),
            stats.read.sum,
            stats.send.sum
        );
    }

    /// Current statistics.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            light_queries: c.light.load(Ordering::Relaxed),
            heavy_queries: c.heavy.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            light_pool: self.light.stats(),
            heavy_pool: self.heavy.stats(),
        }
    }

    /// Finish queued batches and stop both pools.
    pub fn shutdown(&self) {
        self.light.shutdown();
        self.heavy.shutdown();
    }
}

fn read_quietly(reader: &dyn SeriesReader, metric: &Metric, query: &Query) -> Option<Series> {
    match reader.read_series(metric, query.from, query.until, query.now) {
        Ok(series) => Some(series),
        Err(e) => {
            tracing::warn!("Failed to read series of {}: {}", metric.name, e);
            None
        },
    }
}

fn stream_batch(
    reader: &dyn SeriesReader,
    metrics: &[Arc<Metric>],
    query: &Query,
    sink: &dyn SeriesSink,
    broken: &AtomicBool,
    submitted: Instant,
) -> BatchStats {
    let mut stats = BatchStats {
        wait: submitted.elapsed(),
        ..BatchStats::default()
    };

    let mut series = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let read_started = Instant::now();
        match reader.read_series(metric, query.from, query.until, query.now) {
            Ok(s) => {
                if s.present() == 0 {
                    stats.empty_read.accept_duration(read_started.elapsed());
                } else {
                    stats.read.accept_duration(read_started.elapsed());
                }
                stats.points += s.values.len();
                series.push(s);
            },
            Err(e) => {
                stats.errors += 1;
                tracing::warn!("Failed to read series of {}: {}", metric.name, e);
            },
        }
    }
    stats.series = series.len();

    for s in &series {
        if broken.load(Ordering::Acquire) {
            stats.unsent += 1;
            continue;
        }
        let send_started = Instant::now();
        match sink.write_series(s) {
            Ok(()) => stats.send.accept_duration(send_started.elapsed()),
            Err(e) => {
                stats.unsent += 1;
                if !broken.swap(true, Ordering::AcqRel) {
                    tracing::error!("Failed to stream series {}: {}", s.name, e);
                }
            },
        }
    }
    stats
}
