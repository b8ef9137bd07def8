//! One tier's persistent point store.
//!
//! Records are keyed by `(metric id, interval)` (see [`super::record`]) so all
//! points of one metric are contiguous and time ordered. Reads are forward
//! scans that stop at the first key past the end key; finished cursors are
//! released through the [`DisposalQueue`].

use super::disposal::DisposalQueue;
use super::engine::{KvEngine, LogEngine, WriteBatch};
use super::record::{decode_value, encode_value, KeyCodec};
use crate::core::{Clock, DataPoints, EngineKind, Result, TierError, Timestamp};
use crate::retention::RetentionPolicy;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const SCAN_CHUNK: usize = 1024;
const DELETE_BATCH: usize = 10_000;
const PROGRESS_EVERY: u64 = 1_000_000;

/// How an archive stores its records.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Directory of the tier; `None` keeps the tier in memory
    pub dir: Option<PathBuf>,
    /// Engine implementation
    pub engine: EngineKind,
    /// 8-byte metric ids
    pub long_id: bool,
    /// Sync every committed batch
    pub sync_writes: bool,
}

#[derive(Debug, Default)]
struct ArchiveCounters {
    written: AtomicU64,
    deleted: AtomicU64,
    expired_on_write: AtomicU64,
    compacted: AtomicU64,
    scans: AtomicU64,
}

/// Archive statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveStats {
    pub db_name: String,
    pub written: u64,
    pub deleted: u64,
    pub expired_on_write: u64,
    pub compacted: u64,
    pub scans: u64,
}

/// A single tier.
#[derive(Debug)]
pub struct Archive {
    policy: Arc<RetentionPolicy>,
    engine: Arc<dyn KvEngine>,
    codec: KeyCodec,
    disposer: Arc<DisposalQueue>,
    clock: Arc<dyn Clock>,
    counters: ArchiveCounters,
    closed: AtomicBool,
}

impl Archive {
    /// Open the tier described by `policy`.
    pub fn open(
        policy: Arc<RetentionPolicy>,
        options: &ArchiveOptions,
        disposer: Arc<DisposalQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ttl = policy.retention();
        let engine: Arc<dyn KvEngine> = match (options.engine, &options.dir) {
            (EngineKind::Log, Some(dir)) => Arc::new(LogEngine::open(
                dir,
                ttl,
                options.sync_writes,
                Arc::clone(&clock),
            )?),
            (EngineKind::Log, None) => {
                Arc::new(LogEngine::in_memory_with_clock(ttl, Arc::clone(&clock)))
            },
            #[cfg(feature = "persistent")]
            (EngineKind::Rocksdb, Some(dir)) => Arc::new(super::engine::RocksEngine::open(
                dir,
                ttl,
                options.sync_writes,
            )?),
            (EngineKind::Rocksdb, _) => {
                return Err(TierError::config(
                    "rocksdb archives need a directory and the `persistent` feature",
                ))
            },
        };
        tracing::info!("Opened archive {} ({:?})", policy.db_name(), options.dir);
        Ok(Self::with_engine(policy, engine, KeyCodec::new(options.long_id), disposer, clock))
    }

    /// Archive over an already opened engine.
    pub fn with_engine(
        policy: Arc<RetentionPolicy>,
        engine: Arc<dyn KvEngine>,
        codec: KeyCodec,
        disposer: Arc<DisposalQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            engine,
            codec,
            disposer,
            clock,
            counters: ArchiveCounters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Tier policy.
    pub fn policy(&self) -> &Arc<RetentionPolicy> {
        &self.policy
    }

    /// Tier name.
    pub fn db_name(&self) -> &str {
        self.policy.db_name()
    }

    /// Write every point routed to this tier in one atomic batch.
    ///
    /// Invalid points, points without a metric id, points routed elsewhere
    /// and points outside the retention window are skipped silently.
    pub fn put_batch(&self, points: &DataPoints) -> Result<usize> {
        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        for routed in points.iter() {
            let point = &routed.point;
            if !point.is_valid() {
                continue;
            }
            let Some(metric_id) = point.metric_id else {
                continue;
            };
            if !routed
                .policy
                .as_ref()
                .is_some_and(|p| p.db_name() == self.db_name())
            {
                continue;
            }
            if !self.policy.includes(point.ts, now) {
                self.note_expired(&point.name, point.ts, now);
                continue;
            }
            match self.codec.encode_key(metric_id, self.policy.interval(point.ts)) {
                Ok(key) => batch.put(&key, &encode_value(point.value)),
                Err(e) => tracing::warn!("Skipping point of {}: {}", point.name, e),
            }
        }

        let count = batch.len();
        if count > 0 {
            self.engine.write(batch)?;
            self.counters.written.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(count)
    }

    /// Write a single interval value.
    pub fn put(&self, metric_id: u64, interval: Timestamp, value: f64) -> Result<()> {
        let key = self.codec.encode_key(metric_id, interval)?;
        self.engine.put(&key, &encode_value(value))?;
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stored `(ts, value)` pairs of `metric_id` within `[from, to]`.
    pub fn get_range(
        &self,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<(Timestamp, f64)>> {
        let mut out = Vec::new();
        self.scan_metric(metric_id, from, to, usize::MAX, |ts, value| {
            out.push((ts, decode_value(value)?));
            Ok(())
        })?;
        Ok(out)
    }

    /// One slot per `step` from `from` through `to`; missing intervals are `None`.
    pub fn get_range_fixed_step(
        &self,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
        step: u32,
    ) -> Result<Vec<Option<f64>>> {
        if step == 0 {
            return Err(TierError::storage("fixed step read with step 0"));
        }
        let mut out = Vec::new();
        let mut expected = u64::from(from);
        self.scan_metric(metric_id, from, to, usize::MAX, |ts, value| {
            let ts = u64::from(ts);
            if ts < expected {
                return Ok(());
            }
            while expected < ts {
                out.push(None);
                expected += u64::from(step);
            }
            out.push(Some(decode_value(value)?));
            expected += u64::from(step);
            Ok(())
        })?;
        while expected <= u64::from(to) {
            out.push(None);
            expected += u64::from(step);
        }
        Ok(out)
    }

    /// First stored point of `metric_id` within `[from, to]`.
    pub fn get_first(
        &self,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Option<(Timestamp, f64)>> {
        let mut first = None;
        self.scan_metric(metric_id, from, to, 1, |ts, value| {
            first = Some((ts, decode_value(value)?));
            Ok(())
        })?;
        Ok(first)
    }

    /// Delete every record of `metric_id`, or only those inside `window`.
    pub fn delete_metric(
        &self,
        metric_id: u64,
        window: Option<(Timestamp, Timestamp)>,
    ) -> Result<usize> {
        let (from, to) = window.unwrap_or((0, Timestamp::MAX));
        let mut keys = Vec::new();
        self.scan_metric(metric_id, from, to, usize::MAX, |ts, _| {
            keys.push(self.codec.encode_key(metric_id, ts)?);
            Ok(())
        })?;
        let mut batch = WriteBatch::new();
        for key in &keys {
            batch.delete(key);
        }
        let deleted = batch.len();
        self.engine.write(batch)?;
        self.counters.deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        Ok(deleted)
    }

    /// Delete every record stored at exactly `ts`, across all metrics.
    ///
    /// Walks the whole archive; meant for maintenance, not the hot path.
    pub fn delete_interval(&self, ts: Timestamp) -> Result<usize> {
        let mut cursor = self.engine.scan(None, SCAN_CHUNK)?;
        let result = (|| -> Result<usize> {
            let mut batch = WriteBatch::new();
            let mut scanned = 0u64;
            let mut deleted = 0usize;
            for item in cursor.by_ref() {
                let (key, _) = item?;
                scanned += 1;
                if scanned % PROGRESS_EVERY == 0 {
                    tracing::info!(
                        "delete_interval {} on {}: scanned {}, deleted {}",
                        ts,
                        self.db_name(),
                        scanned,
                        deleted + batch.len()
                    );
                }
                if self.codec.decode_ts(&key)? == ts {
                    batch.delete(&key);
                    if batch.len() >= DELETE_BATCH {
                        deleted += batch.len();
                        self.engine.write(std::mem::take(&mut batch))?;
                    }
                }
            }
            deleted += batch.len();
            self.engine.write(batch)?;
            Ok(deleted)
        })();
        self.disposer.dispose(cursor);
        self.counters.scans.fetch_add(1, Ordering::Relaxed);

        let deleted = result?;
        self.counters.deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        tracing::info!("Deleted {} records at {} from {}", deleted, ts, self.db_name());
        Ok(deleted)
    }

    /// Drop records older than the retention.
    pub fn compact(&self) -> Result<usize> {
        let removed = self.engine.compact()?;
        self.counters.compacted.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Flush buffered writes.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Flush and close. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Closing archive {}", self.db_name());
        self.engine.close()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ArchiveStats {
        ArchiveStats {
            db_name: self.db_name().to_string(),
            written: self.counters.written.load(Ordering::Relaxed),
            deleted: self.counters.deleted.load(Ordering::Relaxed),
            expired_on_write: self.counters.expired_on_write.load(Ordering::Relaxed),
            compacted: self.counters.compacted.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed),
        }
    }

    fn scan_metric<F>(
        &self,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(Timestamp, &[u8]) -> Result<()>,
    {
        let start = self.codec.encode_key(metric_id, from)?;
        let end = self.codec.encode_key(metric_id, to)?;
        let mut cursor = self.engine.scan(Some(&start), limit.min(SCAN_CHUNK))?;
        let result = (|| -> Result<()> {
            let mut seen = 0usize;
            for item in cursor.by_ref() {
                let (key, value) = item?;
                if key.as_slice() > end.as_slice() {
                    break;
                }
                visit(self.codec.decode_ts(&key)?, &value)?;
                seen += 1;
                if seen >= limit {
                    break;
                }
            }
            Ok(())
        })();
        self.disposer.dispose(cursor);
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn note_expired(&self, name: &str, ts: Timestamp, now: Timestamp) {
        let n = self.counters.expired_on_write.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 10_000 == 0 {
            tracing::debug!(
                "Point {}@{} outside {} window at {} ({} expired so far)",
                name,
                ts,
                self.policy.name(),
                now,
                n
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{Cursor, KvPair};
    use crate::core::{DataPoint, ManualClock, Metric};
    use std::time::Duration;
    use pretty_assertions::assert_eq;

    const NOW: Timestamp = 1_000_000;

    struct Fixture {
        archive: Archive,
        policy: Arc<RetentionPolicy>,
        clock: Arc<ManualClock>,
    }

    fn fixture(policy: &str) -> Fixture {
        let policy = Arc::new(RetentionPolicy::parse(policy).unwrap());
        let clock = Arc::new(ManualClock::new(NOW));
        let options = ArchiveOptions {
            dir: None,
            engine: EngineKind::Log,
            long_id: false,
            sync_writes: false,
        };
        let archive = Archive::open(
            Arc::clone(&policy),
            &options,
            Arc::new(DisposalQueue::new(64).unwrap()),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            archive,
            policy,
            clock,
        }
    }

    fn routed(f: &Fixture, id: u64, ts: Timestamp, value: f64) -> DataPoints {
        let metric = Arc::new(Metric::new(id, format!("m{id}"), vec![Arc::clone(&f.policy)]));
        let mut points = DataPoints::new();
        let point = DataPoint::new(metric.name.clone(), value, ts);
        points.push(point, Some(metric), Some(Arc::clone(&f.policy)));
        points
    }

    #[test]
    fn test_write_then_read_exact_bits() {
        let f = fixture("60s:24h");
        let value = 0.1 + 0.2;
        assert_eq!(f.archive.put_batch(&routed(&f, 7, NOW - 120, value)).unwrap(), 1);
        let read = f.archive.get_range(7, NOW - 120, NOW - 120).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1.to_bits(), value.to_bits());
    }

    #[test]
    fn test_put_batch_skips_without_error() {
        let f = fixture("60s:24h");
        let other = Arc::new(RetentionPolicy::parse("5m:7d").unwrap());
        let metric = Arc::new(Metric::new(1, "m1", vec![Arc::clone(&f.policy)]));
        let mut points = DataPoints::new();
        // kept
        let tier = || Some(Arc::clone(&f.policy));
        points.push(DataPoint::new("m1", 1.0, NOW - 60), Some(Arc::clone(&metric)), tier());
        // expired
        let expired = DataPoint::new("m1", 2.0, NOW - 2 * 86_400);
        points.push(expired, Some(Arc::clone(&metric)), tier());
        // no metric id
        points.push(DataPoint::new("m2", 3.0, NOW - 60), None, tier());
        // routed to another tier
        points.push(DataPoint::new("m1", 4.0, NOW - 120), Some(Arc::clone(&metric)), Some(other));
        // dropped
        let mut dropped = DataPoint::new("m1", 5.0, NOW - 180);
        dropped.drop_point();
        points.push(dropped, Some(metric), tier());

        assert_eq!(f.archive.put_batch(&points).unwrap(), 1);
        assert_eq!(f.archive.stats().expired_on_write, 1);
        assert_eq!(f.archive.get_range(1, 0, NOW).unwrap(), vec![(NOW - 60, 1.0)]);
    }

    #[test]
    fn test_range_read_stops_at_metric_boundary() {
        let f = fixture("60s:24h");
        for (id, ts, v) in [(1, 60, 1.0), (1, 120, 2.0), (2, 60, 9.0), (1, 180, 3.0)] {
            f.archive.put(id, ts, v).unwrap();
        }
        assert_eq!(
            f.archive.get_range(1, 0, 1_000).unwrap(),
            vec![(60, 1.0), (120, 2.0), (180, 3.0)]
        );
        assert_eq!(f.archive.get_range(1, 100, 150).unwrap(), vec![(120, 2.0)]);
        assert!(f.archive.get_range(3, 0, 1_000).unwrap().is_empty());
    }

    #[test]
    fn test_fixed_step_fills_interior_gaps() {
        let f = fixture("60s:24h");
        f.archive.put(5, 600, 1.0).unwrap();
        f.archive.put(5, 900, 2.0).unwrap();
        let values = f.archive.get_range_fixed_step(5, 600, 900, 60).unwrap();
        assert_eq!(values, vec![Some(1.0), None, None, None, None, Some(2.0)]);
    }

    #[test]
    fn test_fixed_step_pads_trailing_gaps() {
        let f = fixture("60s:24h");
        f.archive.put(5, 660, 4.0).unwrap();
        let values = f.archive.get_range_fixed_step(5, 600, 840, 60).unwrap();
        assert_eq!(values, vec![None, Some(4.0), None, None, None]);
        assert_eq!(f.archive.get_range_fixed_step(6, 0, 120, 60).unwrap(), vec![None; 3]);
    }

    #[test]
    fn test_get_first() {
        let f = fixture("60s:24h");
        f.archive.put(3, 240, 2.0).unwrap();
        f.archive.put(3, 300, 3.0).unwrap();
        assert_eq!(f.archive.get_first(3, 0, 1_000).unwrap(), Some((240, 2.0)));
        assert_eq!(f.archive.get_first(3, 250, 1_000).unwrap(), Some((300, 3.0)));
        assert_eq!(f.archive.get_first(3, 400, 1_000).unwrap(), None);
    }

    #[test]
    fn test_delete_interval_only_touches_that_timestamp() {
        let f = fixture("60s:24h");
        for id in 1..=3 {
            for ts in [60, 120, 180] {
                f.archive.put(id, ts, f64::from(ts)).unwrap();
            }
        }
        assert_eq!(f.archive.delete_interval(120).unwrap(), 3);
        for id in 1..=3 {
            assert_eq!(
                f.archive.get_range(id, 0, 1_000).unwrap(),
                vec![(60, 60.0), (180, 180.0)]
            );
        }
        assert_eq!(f.archive.delete_interval(120).unwrap(), 0);
    }

    #[test]
    fn test_delete_metric_whole_and_windowed() {
        let f = fixture("60s:24h");
        for ts in [60, 120, 180, 240] {
            f.archive.put(1, ts, 1.0).unwrap();
            f.archive.put(2, ts, 2.0).unwrap();
        }
        assert_eq!(f.archive.delete_metric(1, Some((100, 200))).unwrap(), 2);
        assert_eq!(
            f.archive.get_range(1, 0, 1_000).unwrap(),
            vec![(60, 1.0), (240, 1.0)]
        );
        assert_eq!(f.archive.delete_metric(1, None).unwrap(), 2);
        assert!(f.archive.get_range(1, 0, 1_000).unwrap().is_empty());
        assert_eq!(f.archive.get_range(2, 0, 1_000).unwrap().len(), 4);
    }

    #[test]
    fn test_compaction_uses_retention_as_ttl() {
        let f = fixture("60s:1h");
        f.archive.put(1, NOW - 60, 1.0).unwrap();
        f.clock.advance(3_601);
        f.archive.put(1, NOW, 2.0).unwrap();
        assert_eq!(f.archive.compact().unwrap(), 1);
        assert_eq!(f.archive.get_range(1, 0, u32::MAX).unwrap(), vec![(NOW, 2.0)]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let f = fixture("60s:24h");
        f.archive.close().unwrap();
        f.archive.close().unwrap();
        assert!(f.archive.put(1, 60, 1.0).is_err());
    }

    /// Wraps the built-in engine and reports the thread each cursor dies on.
    #[derive(Debug)]
    struct ReleaseTracking {
        inner: LogEngine,
        released_on: crossbeam_channel::Sender<Option<String>>,
    }

    struct Tracked {
        inner: Cursor,
        released_on: crossbeam_channel::Sender<Option<String>>,
    }

    impl Iterator for Tracked {
        type Item = Result<KvPair>;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            let name = std::thread::current().name().map(str::to_string);
            let _ = self.released_on.send(name);
        }
    }

    impl KvEngine for ReleaseTracking {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> Result<()> {
            self.inner.delete(key)
        }

        fn write(&self, batch: WriteBatch) -> Result<()> {
            self.inner.write(batch)
        }

        fn scan(&self, from: Option<&[u8]>, chunk: usize) -> Result<Cursor> {
            Ok(Cursor::new(Tracked {
                inner: self.inner.scan(from, chunk)?,
                released_on: self.released_on.clone(),
            }))
        }

        fn compact(&self) -> Result<usize> {
            self.inner.compact()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_cursors_are_released_off_the_request_thread() {
        let policy = Arc::new(RetentionPolicy::parse("60s:24h").unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = Arc::new(ReleaseTracking {
            inner: LogEngine::in_memory(86_400),
            released_on: tx,
        });
        let archive = Archive::with_engine(
            policy,
            engine,
            KeyCodec::new(false),
            Arc::new(DisposalQueue::new(8).unwrap()),
            Arc::new(ManualClock::new(NOW)),
        );
        archive.put(1, NOW - 60, 1.0).unwrap();
        archive.put(2, NOW - 60, 2.0).unwrap();

        assert_eq!(archive.get_range(1, 0, NOW).unwrap(), vec![(NOW - 60, 1.0)]);
        assert_eq!(archive.delete_interval(NOW - 60).unwrap(), 2);

        for _ in 0..2 {
            let released = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(released.as_deref(), Some("tierdb-disposal"));
        }
    }
}
