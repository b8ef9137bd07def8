//! Per-tier aggregation of grouped staging values.
//!
//! Each destination tier gets an [`IntervalProcessor`]: a bounded queue of
//! [`IntervalValues`] drained by a fixed set of consumer threads. Consumers
//! reduce each group with the metric's aggregation method and hand the
//! resulting points to a [`PointSink`] (the store), which may stage them again
//! for the next lower tier.

use crate::aggregation::AggregationPolicySource;
use crate::core::{DataPoint, DataPoints, Metric, Result, TierError, Timestamp};
use crate::retention::RetentionPolicy;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Raw values of one metric within one interval of one tier.
#[derive(Debug, Clone)]
pub struct IntervalValues {
    /// Metric the values belong to
    pub metric: Arc<Metric>,
    /// Raw values in sorted-file order
    pub values: Vec<f64>,
    /// Interval start in the destination tier
    pub interval: Timestamp,
    /// Destination tier
    pub db_name: String,
}

impl IntervalValues {
    /// The aggregated point for this group, routed to its tier, or `None`
    /// when the group cannot be aggregated.
    pub fn to_point(
        &self,
        source: &AggregationPolicySource,
    ) -> Option<(DataPoint, Arc<Metric>, Arc<RetentionPolicy>)> {
        let metric = &self.metric;
        if !metric.is_leaf() {
            tracing::error!("Metric {} ({}) is not a leaf metric", metric.name, metric.id);
            return None;
        }
        let Some(policy) = source.policy_for(&metric.name) else {
            tracing::error!("Metric {} ({}) has no aggregation policy", metric.name, metric.id);
            return None;
        };
        let Some(tier) = metric
            .retention_policies
            .iter()
            .find(|p| p.db_name() == self.db_name)
        else {
            tracing::error!("Metric {} has no {} tier", metric.name, self.db_name);
            return None;
        };
        let value = policy.method.reduce(&metric.name, &self.values)?;
        let point =
            DataPoint::new(metric.name.clone(), value, self.interval).with_metric_id(metric.id);
        Some((point, Arc::clone(metric), Arc::clone(tier)))
    }
}

/// Receiver of aggregated points.
pub trait PointSink: Send + Sync {
    /// Write points already routed to their tier.
    fn insert_points(&self, points: DataPoints) -> Result<usize>;
}

/// Late-bound sink; the store attaches itself once constructed.
pub type SinkSlot = Arc<RwLock<Option<Weak<dyn PointSink>>>>;

/// Aggregation settings shared by all tiers.
#[derive(Debug, Clone)]
pub struct IntervalOptions {
    /// Capacity of each tier's queue
    pub queue_size: usize,
    /// Consumer threads per tier
    pub consumers: usize,
    /// Groups reduced and written per batch
    pub batch_size: usize,
    /// Consumer wait when the queue is empty
    pub empty_queue_pause: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    aggregated: AtomicU64,
    skipped: AtomicU64,
    written: AtomicU64,
    failed_batches: AtomicU64,
}

/// Statistics of one tier's processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalStats {
    pub db_name: String,
    pub queued: u64,
    pub aggregated: u64,
    pub skipped: u64,
    pub written: u64,
    pub failed_batches: u64,
    pub pending: usize,
}

/// Queue plus consumer pool for one destination tier.
pub struct IntervalProcessor {
    db_name: String,
    tx: RwLock<Option<Sender<IntervalValues>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    pending: Arc<AtomicU64>,
}

impl std::fmt::Debug for IntervalProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalProcessor")
            .field("db_name", &self.db_name)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl IntervalProcessor {
    /// Start the consumers of `db_name`.
    pub fn start(
        db_name: &str,
        options: &IntervalOptions,
        source: Arc<AggregationPolicySource>,
        sink: SinkSlot,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<IntervalValues>(options.queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let pending = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(options.consumers);
        for n in 0..options.consumers.max(1) {
            let consumer = Consumer {
                db_name: db_name.to_string(),
                rx: rx.clone(),
                source: Arc::clone(&source),
                sink: Arc::clone(&sink),
                counters: Arc::clone(&counters),
                pending: Arc::clone(&pending),
                batch_size: options.batch_size.max(1),
                pause: options.empty_queue_pause,
            };
            let handle = std::thread::Builder::new()
                .name(format!("{db_name}-interval-{n}"))
                .spawn(move || consumer.run())
                .map_err(|e| {
                    TierError::staging(format!("failed to start {db_name} consumer: {e}"))
                })?;
            workers.push(handle);
        }
        tracing::info!("Started {} interval consumers for {}", workers.len(), db_name);
        Ok(Self {
            db_name: db_name.to_string(),
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
            pending,
        })
    }

    /// Queue a group, blocking while the queue is full.
    pub fn put(&self, values: IntervalValues) -> Result<()> {
        let tx = self.tx.read().clone().ok_or(TierError::Shutdown)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(values).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(TierError::Shutdown);
        }
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Groups queued or being written.
    pub fn pending(&self) -> usize {
        usize::try_from(self.pending.load(Ordering::Acquire)).unwrap_or(usize::MAX)
    }

    /// Wait until every queued group was written. `false` on timeout.
    pub fn await_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> IntervalStats {
        IntervalStats {
            db_name: self.db_name.clone(),
            queued: self.counters.queued.load(Ordering::Relaxed),
            aggregated: self.counters.aggregated.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Drain the queue and stop the consumers.
    ///
    /// A consumer can end up here itself when it drops the last reference to
    /// the sink; it is left to finish its batch and exit on its own.
    pub fn shutdown(&self) {
        drop(self.tx.write().take());
        let current = std::thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Interval consumer of {} panicked", self.db_name);
            }
        }
    }
}

struct Consumer {
    db_name: String,
    rx: Receiver<IntervalValues>,
    source: Arc<AggregationPolicySource>,
    sink: SinkSlot,
    counters: Arc<Counters>,
    pending: Arc<AtomicU64>,
    batch_size: usize,
    pause: Duration,
}

impl Consumer {
    fn run(self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            match self.rx.recv_timeout(self.pause) {
                Ok(first) => {
                    batch.push(first);
                    batch.extend(self.rx.try_iter().take(self.batch_size - 1));
                    let n = batch.len() as u64;
                    self.process(std::mem::take(&mut batch));
                    self.pending.fetch_sub(n, Ordering::AcqRel);
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("Interval consumer of {} stopped", self.db_name);
    }

    fn process(&self, batch: Vec<IntervalValues>) {
        let mut points = DataPoints::with_capacity(batch.len());
        for values in &batch {
            match values.to_point(&self.source) {
                Some((point, metric, tier)) => points.push(point, Some(metric), Some(tier)),
                None => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
        self.counters
            .aggregated
            .fetch_add(points.len() as u64, Ordering::Relaxed);
        if points.is_empty() {
            return;
        }

        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        let Some(sink) = sink else {
            self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "No point sink attached, dropping {} {} points",
                points.len(),
                self.db_name
            );
            return;
        };
        match sink.insert_points(points) {
            Ok(n) => {
                self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
            },
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to write aggregated {} points: {}", self.db_name, e);
            },
        }
    }
}

/// Lazily started processors, one per destination tier.
#[derive(Debug)]
pub struct IntervalProcessors {
    options: IntervalOptions,
    source: Arc<AggregationPolicySource>,
    sink: SinkSlot,
    processors: DashMap<String, Arc<IntervalProcessor>>,
}

impl IntervalProcessors {
    /// Processors writing into whatever sink gets attached to `sink`.
    pub fn new(
        options: IntervalOptions,
        source: Arc<AggregationPolicySource>,
        sink: SinkSlot,
    ) -> Self {
        Self {
            options,
            source,
            sink,
            processors: DashMap::new(),
        }
    }

    /// The processor of `db_name`, started on first use.
    pub fn for_db(&self, db_name: &str) -> Result<Arc<IntervalProcessor>> {
        if let Some(p) = self.processors.get(db_name) {
            return Ok(Arc::clone(p.value()));
        }
        let entry = self
            .processors
            .entry(db_name.to_string())
            .or_try_insert_with(|| {
                IntervalProcessor::start(
                    db_name,
                    &self.options,
                    Arc::clone(&self.source),
                    Arc::clone(&self.sink),
                )
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Wait for every processor to drain. `false` on timeout.
    pub fn await_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let all: Vec<_> = self.processors.iter().map(|p| Arc::clone(p.value())).collect();
        all.iter()
            .all(|p| p.await_quiescence(deadline.saturating_duration_since(Instant::now())))
    }

    /// Statistics of every started processor.
    pub fn stats(&self) -> Vec<IntervalStats> {
        let mut stats: Vec<_> = self.processors.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| a.db_name.cmp(&b.db_name));
        stats
    }

    /// Stop every processor after draining its queue.
    pub fn shutdown(&self) {
        for entry in self.processors.iter() {
            entry.value().shutdown();
        }
    }
}
