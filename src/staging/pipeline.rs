//! Intake queue, background writer and scheduled collection of the staging
//! area.
//!
//! `enqueue` never blocks: when the intake queue is full the point is dropped
//! and counted. A single writer thread drains the queue into staging files.
//! Collection (close, sort, group, aggregate) runs on a dedicated pool, either
//! on demand or from the scheduler thread.

use super::file_set::FileSetId;
use super::files::{CollectIdle, StagingFiles};
use super::interval::{IntervalOptions, IntervalProcessors, IntervalStats, PointSink, SinkSlot};
use super::record::StagingRecord;
use super::sort::Sorter;
use super::sorted::SortedStagingFile;
use crate::aggregation::AggregationPolicySource;
use crate::core::config::StagingConfig;
use crate::core::{Clock, MetricIndex, Result, TierError, Timestamp};
use crate::retention::PolicyRegistry;
use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    saved: AtomicU64,
    write_errors: AtomicU64,
}

/// Staging statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingStats {
    pub received: u64,
    pub dropped: u64,
    pub saved: u64,
    pub write_errors: u64,
    pub queue_depth: usize,
    pub open_files: usize,
    pub intervals: Vec<IntervalStats>,
}

/// Outcome of one file processed by a propagation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub db_name: String,
    pub path: PathBuf,
    /// Raw values read
    pub lines: u64,
    /// Groups handed to aggregation
    pub groups: u64,
    /// Groups skipped (unknown metric)
    pub skipped: u64,
    pub elapsed_ms: u64,
}

/// The staging area.
pub struct StagingPipeline {
    config: StagingConfig,
    tx: RwLock<Option<Sender<StagingRecord>>>,
    files: Arc<StagingFiles>,
    processors: IntervalProcessors,
    sink: SinkSlot,
    index: Arc<dyn MetricIndex>,
    registry: Arc<PolicyRegistry>,
    pool: ThreadPool,
    counters: Arc<Counters>,
    writer: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    propagating: Mutex<()>,
}

impl std::fmt::Debug for StagingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingPipeline")
            .field("dir", &self.files.dir())
            .field("received", &self.counters.received.load(Ordering::Relaxed))
            .field("dropped", &self.counters.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl StagingPipeline {
    /// Open the staging directory and start the writer thread.
    ///
    /// Aggregated points go nowhere until a sink is attached.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        config: &StagingConfig,
        dir: PathBuf,
        sorter: Arc<dyn Sorter>,
        registry: Arc<PolicyRegistry>,
        index: Arc<dyn MetricIndex>,
        source: Arc<AggregationPolicySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let files = Arc::new(StagingFiles::open(
            dir,
            sorter,
            Arc::clone(&registry),
            clock,
            CollectIdle::new(config.collect_idle.clone()),
        )?);
        let sink: SinkSlot = Arc::new(RwLock::new(None));
        let processors = IntervalProcessors::new(
            IntervalOptions {
                queue_size: config.intervals_queue_size,
                consumers: config.interval_consumers,
                batch_size: config.interval_batch_size,
                empty_queue_pause: config.empty_queue_pause,
            },
            source,
            Arc::clone(&sink),
        );
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.propagate_threads.max(1))
            .thread_name(|i| format!("tierdb-propagate-{i}"))
            .build()
            .map_err(|e| TierError::staging(format!("failed to build propagate pool: {e}")))?;

        let (tx, rx) = bounded(config.queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let writer = Writer {
            rx,
            files: Arc::clone(&files),
            counters: Arc::clone(&counters),
            batch_size: config.batch_size.max(1),
            pause: config.empty_queue_pause,
        };
        let writer = std::thread::Builder::new()
            .name("tierdb-staging-writer".into())
            .spawn(move || writer.run())
            .map_err(|e| TierError::staging(format!("failed to start staging writer: {e}")))?;

        tracing::info!("Staging area open at {:?}", files.dir());
        Ok(Self {
            config: config.clone(),
            tx: RwLock::new(Some(tx)),
            files,
            processors,
            sink,
            index,
            registry,
            pool,
            counters,
            writer: Mutex::new(Some(writer)),
            scheduler: Mutex::new(None),
            propagating: Mutex::new(()),
        })
    }

    /// Route aggregated points into `sink`.
    pub fn attach(&self, sink: Weak<dyn PointSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Stage a raw value for interval `from` of tier `db_name`.
    ///
    /// `metric_name` is stored alongside the id so the group can still be
    /// resolved if the id is gone from the index by collection time.
    /// Returns `false` when the point was dropped because the intake queue is
    /// full or the pipeline is shut down.
    pub fn enqueue(
        &self,
        db_name: &str,
        from: Timestamp,
        metric_id: u64,
        value: f64,
        metric_name: Option<&str>,
    ) -> bool {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let shard = u32::try_from(metric_id % u64::from(self.config.shards.max(1))).unwrap_or(0);
        let record = StagingRecord {
            file_set: FileSetId::new(db_name, from, shard),
            metric_id,
            value,
            metric_name: metric_name.map(str::to_string),
        };
        let sent = match self.tx.read().as_ref() {
            Some(tx) => match tx.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
            },
            None => false,
        };
        if !sent {
            let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 10_000 == 0 {
                tracing::warn!("Staging queue full, dropped {} points so far", dropped);
            }
        }
        sent
    }

    /// Wait until every accepted point reached a staging file, then flush.
    pub fn sync(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let c = &self.counters;
            let accounted = c.saved.load(Ordering::Acquire)
                + c.dropped.load(Ordering::Acquire)
                + c.write_errors.load(Ordering::Acquire);
            if accounted >= c.received.load(Ordering::Acquire) {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.files.flush()?;
        Ok(true)
    }

    /// Collect, sort and aggregate file-sets of every tier.
    ///
    /// Only idle file-sets are collected unless `force` is set. Files are
    /// processed in parallel; one failing file does not stop the others.
    pub fn propagate(&self, force: bool) -> Vec<FileStats> {
        let _guard = self.propagating.lock();
        tracing::info!("Propagating points from staged files");
        let sorted: Vec<SortedStagingFile> = self
            .registry
            .all()
            .iter()
            .flat_map(|p| self.files.collect(p.db_name(), force))
            .collect();

        let results: Vec<Result<FileStats>> =
            self.pool
                .install(|| sorted.into_par_iter().map(|file| self.process_file(file)).collect());
        let mut stats = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(s) => stats.push(s),
                Err(e) => tracing::error!("Failed to process staging file: {}", e),
            }
        }
        tracing::info!("Finished propagating, processed {} files", stats.len());
        stats
    }

    fn process_file(&self, mut file: SortedStagingFile) -> Result<FileStats> {
        let started = Instant::now();
        let processor = self.processors.for_db(file.db_name())?;
        file.open()?;
        let mut stats = FileStats {
            db_name: file.db_name().to_string(),
            path: file.path().to_path_buf(),
            lines: 0,
            groups: 0,
            skipped: 0,
            elapsed_ms: 0,
        };
        let result = (|| -> Result<()> {
            loop {
                match file.next_group(self.index.as_ref()) {
                    Ok(Some(values)) => {
                        stats.lines += values.values.len() as u64;
                        stats.groups += 1;
                        processor.put(values)?;
                    },
                    Ok(None) => return Ok(()),
                    Err(e) if e.is_recoverable() => {
                        stats.skipped += 1;
                        tracing::warn!("Skipping group in {:?}: {}", file.path(), e);
                    },
                    Err(e) => return Err(e),
                }
            }
        })();
        file.close();
        result?;
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            "Processed {:?} for {}: {} raw values into {} points in {}ms",
            stats.path,
            stats.db_name,
            stats.lines,
            stats.groups,
            stats.elapsed_ms
        );
        Ok(stats)
    }

    /// Delete staging files older than the configured maximum age.
    pub fn cleanup(&self) -> Result<usize> {
        self.files.delete_older_than(self.config.max_file_age)
    }

    /// Wait until aggregation queues are drained. `false` on timeout.
    pub fn await_aggregation(&self, timeout: Duration) -> bool {
        self.processors.await_quiescence(timeout)
    }

    /// Run propagation and cleanup on their configured periods until shut down.
    pub fn start_schedules(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pipeline = Arc::downgrade(self);
        let propagate_every = self.config.propagate_interval;
        let cleanup_every = self.config.cleanup_interval;
        let handle = std::thread::Builder::new()
            .name("tierdb-staging-scheduler".into())
            .spawn(move || run_schedules(pipeline, stop_rx, propagate_every, cleanup_every))
            .map_err(|e| TierError::staging(format!("failed to start staging scheduler: {e}")))?;
        *scheduler = Some((stop_tx, handle));
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> StagingStats {
        StagingStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            saved: self.counters.saved.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            queue_depth: self.tx.read().as_ref().map_or(0, Sender::len),
            open_files: self.files.open_count(),
            intervals: self.processors.stats(),
        }
    }

    /// Stop the scheduler and the writer, then drain aggregation. Idempotent.
    pub fn shutdown(&self) {
        if let Some((stop, handle)) = self.scheduler.lock().take() {
            drop(stop);
            // the scheduler itself may hold the last reference
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("Staging scheduler panicked");
            }
        }
        drop(self.tx.write().take());
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                tracing::error!("Staging writer panicked");
            }
        }
        self.processors.shutdown();
    }
}

impl Drop for StagingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Job {
    Propagate,
    Cleanup,
}

fn run_schedules(
    pipeline: Weak<StagingPipeline>,
    stop: Receiver<()>,
    propagate_every: Duration,
    cleanup_every: Duration,
) {
    let propagate = tick(propagate_every);
    let cleanup = tick(cleanup_every);
    loop {
        let job = select! {
            recv(stop) -> _ => None,
            recv(propagate) -> _ => Some(Job::Propagate),
            recv(cleanup) -> _ => Some(Job::Cleanup),
        };
        let Some(job) = job else {
            break;
        };
        let Some(pipeline) = pipeline.upgrade() else {
            break;
        };
        match job {
            Job::Propagate => {
                pipeline.propagate(false);
            },
            Job::Cleanup => {
                if let Err(e) = pipeline.cleanup() {
                    tracing::error!("Staging cleanup failed: {}", e);
                }
            },
        }
    }
    tracing::debug!("Staging scheduler stopped");
}

struct Writer {
    rx: Receiver<StagingRecord>,
    files: Arc<StagingFiles>,
    counters: Arc<Counters>,
    batch_size: usize,
    pause: Duration,
}

impl Writer {
    fn run(self) {
        let mut batch = Vec::with_capacity(self.batch_size.min(1 << 16));
        loop {
            match self.rx.recv_timeout(self.pause) {
                Ok(first) => {
                    batch.push(first);
                    batch.extend(self.rx.try_iter().take(self.batch_size - 1));
                    self.write(&mut batch);
                },
                Err(RecvTimeoutError::Timeout) => {
                    // idle, good moment to flush
                    if let Err(e) = self.files.flush() {
                        tracing::error!("Failed to flush staging files: {}", e);
                    }
                },
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.files.close();
        tracing::info!("Staging writer stopped");
    }

    fn write(&self, batch: &mut Vec<StagingRecord>) {
        let mut saved = 0u64;
        let mut failed = 0u64;
        for record in batch.drain(..) {
            match self.files.write(&record) {
                Ok(()) => saved += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!("Failed to stage record for {}: {}", record.file_set, e);
                },
            }
        }
        self.counters.write_errors.fetch_add(failed, Ordering::Release);
        self.counters.saved.fetch_add(saved, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataPoints, InMemoryMetricIndex, ManualClock, Metric};
    use crate::staging::sort::InMemorySort;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<(u64, Timestamp, f64)>>);

    impl PointSink for Recorder {
        fn insert_points(&self, points: DataPoints) -> Result<usize> {
            let mut out = self.0.lock();
            for r in points.iter() {
                out.push((r.point.metric_id.unwrap_or(0), r.point.ts, r.point.value));
            }
            Ok(points.len())
        }
    }

    struct Fixture {
        _dir: TempDir,
        pipeline: StagingPipeline,
        sink: Arc<dyn PointSink>,
        recorder: Arc<Recorder>,
    }

    fn fixture(queue_size: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(PolicyRegistry::with_chain(&["60s:24h", "5m:7d"]).unwrap());
        let index = Arc::new(InMemoryMetricIndex::new(registry.all()));
        for id in 1..=3 {
            index.insert(Metric::new(id, format!("m{id}"), registry.all()));
        }
        let config = StagingConfig {
            queue_size,
            shards: 2,
            empty_queue_pause: Duration::from_millis(5),
            ..StagingConfig::default()
        };
        let pipeline = StagingPipeline::open(
            &config,
            dir.path().to_path_buf(),
            Arc::new(InMemorySort),
            registry,
            index,
            Arc::new(AggregationPolicySource::from_lines(["avg = *"]).unwrap()),
            Arc::new(ManualClock::new(1_000_000)),
        )
        .unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink: Arc<dyn PointSink> = recorder.clone();
        pipeline.attach(Arc::downgrade(&sink));
        Fixture {
            _dir: dir,
            pipeline,
            sink,
            recorder,
        }
    }

    #[test]
    fn test_stage_collect_aggregate() {
        let f = fixture(1_000);
        for (id, value) in [(1, 1.0), (2, 10.0), (1, 3.0), (3, 7.0), (2, 20.0)] {
            assert!(f.pipeline.enqueue("5m7d", 300, id, value, None));
        }
        assert!(f.pipeline.sync(Duration::from_secs(5)).unwrap());
        // shards 0 and 1
        assert_eq!(f.pipeline.stats().open_files, 2);

        let files = f.pipeline.propagate(true);
        assert_eq!(files.len(), 2);
        assert_eq!(files.iter().map(|s| s.lines).sum::<u64>(), 5);
        assert!(f.pipeline.await_aggregation(Duration::from_secs(5)));

        let mut points = f.recorder.0.lock().clone();
        points.sort_by_key(|p| p.0);
        assert_eq!(points, vec![(1, 300, 2.0), (2, 300, 15.0), (3, 300, 7.0)]);
        assert!(Arc::strong_count(&f.sink) >= 1);
    }

    /// Holds the only other handle on a pipeline and lets go of it from the
    /// consumer thread once told to.
    struct LastHandle {
        pipeline: Mutex<Option<Arc<StagingPipeline>>>,
        go: Receiver<()>,
        done: Sender<usize>,
    }

    impl PointSink for LastHandle {
        fn insert_points(&self, points: DataPoints) -> Result<usize> {
            let _ = self.go.recv_timeout(Duration::from_secs(5));
            let pipeline = self.pipeline.lock().take();
            drop(pipeline);
            let _ = self.done.send(points.len());
            Ok(points.len())
        }
    }

    #[test]
    fn test_pipeline_dropped_on_consumer_thread() {
        let Fixture { _dir: dir, pipeline, .. } = fixture(1_000);
        let pipeline = Arc::new(pipeline);
        let (go_tx, go_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let sink: Arc<dyn PointSink> = Arc::new(LastHandle {
            pipeline: Mutex::new(Some(Arc::clone(&pipeline))),
            go: go_rx,
            done: done_tx,
        });
        pipeline.attach(Arc::downgrade(&sink));

        assert!(pipeline.enqueue("5m7d", 300, 1, 4.0, Some("m1")));
        assert!(pipeline.sync(Duration::from_secs(5)).unwrap());
        assert_eq!(pipeline.propagate(true).len(), 1);
        drop(pipeline);
        go_tx.send(()).unwrap();

        // the consumer ran the whole shutdown and came back
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        drop(sink);
        drop(dir);
    }

    #[test]
    fn test_unknown_metrics_are_skipped() {
        let f = fixture(1_000);
        f.pipeline.enqueue("5m7d", 0, 2, 1.0, None);
        f.pipeline.enqueue("5m7d", 0, 42, 1.0, None);
        f.pipeline.sync(Duration::from_secs(5)).unwrap();
        let files = f.pipeline.propagate(true);
        assert_eq!(files.iter().map(|s| s.skipped).sum::<u64>(), 1);
        assert!(f.pipeline.await_aggregation(Duration::from_secs(5)));
        assert_eq!(f.recorder.0.lock().len(), 1);
    }

    #[test]
    fn test_idle_sets_are_not_collected_early() {
        let f = fixture(1_000);
        f.pipeline.enqueue("5m7d", 0, 1, 1.0, None);
        f.pipeline.sync(Duration::from_secs(5)).unwrap();
        assert!(f.pipeline.propagate(false).is_empty());
    }

    #[test]
    fn test_enqueue_after_shutdown_drops() {
        let f = fixture(1_000);
        f.pipeline.shutdown();
        assert!(!f.pipeline.enqueue("5m7d", 0, 1, 1.0, None));
        let stats = f.pipeline.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.dropped, 1);
    }
}
