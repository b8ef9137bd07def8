//! The tiered point store.
//!
//! Writes go into the tier each point is routed to and, when propagation is
//! enabled, are staged for the next lower tier of the metric's chain. Reads
//! pick the finest tier covering the requested window.

use super::archive::{Archive, ArchiveStats};
use super::cache::{QueryCachePolicy, SeriesCache, SeriesKey};
use super::disposal::{DisposalQueue, DisposalStats};
use super::factory::ArchiveFactory;
use crate::aggregation::AggregationPolicySource;
use crate::core::{
    Clock, Config, DataPoint, DataPoints, ImportResults, InMemoryMetricIndex, Metric, MetricIndex,
    Result, Series, SystemClock, TierError, Timestamp,
};
use crate::retention::{PolicyRegistry, RetentionPolicy};
use crate::staging::{ExternalSort, PointSink, Sorter, StagingPipeline, StagingStats};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreCounters {
    inserted: AtomicU64,
    unrouted: AtomicU64,
    expired: AtomicU64,
    staged: AtomicU64,
    staging_dropped: AtomicU64,
    series_reads: AtomicU64,
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub inserted: u64,
    pub unrouted: u64,
    pub expired: u64,
    pub staged: u64,
    pub staging_dropped: u64,
    pub series_reads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub archives: Vec<ArchiveStats>,
    pub disposal: DisposalStats,
    pub staging: Option<StagingStats>,
}

/// Builder wiring a [`Store`] to its collaborators.
///
/// Anything not set is derived from the configuration.
pub struct StoreBuilder {
    config: Config,
    registry: Option<Arc<PolicyRegistry>>,
    index: Option<Arc<dyn MetricIndex>>,
    aggregation: Option<Arc<AggregationPolicySource>>,
    clock: Option<Arc<dyn Clock>>,
    sorter: Option<Arc<dyn Sorter>>,
}

impl StoreBuilder {
    /// Use an existing policy registry.
    pub fn registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use an external metric index.
    pub fn index(mut self, index: Arc<dyn MetricIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Use an existing aggregation policy source.
    pub fn aggregation(mut self, source: Arc<AggregationPolicySource>) -> Self {
        self.aggregation = Some(source);
        self
    }

    /// Use a custom time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom staging sorter.
    pub fn sorter(mut self, sorter: Arc<dyn Sorter>) -> Self {
        self.sorter = Some(sorter);
        self
    }

    /// Open archives lazily, open the staging area and attach it.
    pub fn open(self) -> Result<Arc<Store>> {
        let config = self.config;
        config.validate()?;

        let registry = match self.registry {
            Some(r) => r,
            None => Arc::new(PolicyRegistry::with_chain(&config.storage.retention)?),
        };
        let index: Arc<dyn MetricIndex> = match self.index {
            Some(i) => i,
            None => Arc::new(InMemoryMetricIndex::new(
                registry.chain(&config.storage.retention.join(","))?,
            )),
        };
        let aggregation = match self.aggregation {
            Some(a) => a,
            None => {
                let source = AggregationPolicySource::from_lines(&config.aggregation.rules)?;
                if let Some(path) = &config.aggregation.rules_file {
                    source.reload_file(path)?;
                }
                Arc::new(source)
            },
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sorter = self
            .sorter
            .unwrap_or_else(|| Arc::new(ExternalSort::new(config.staging.sort_chunk_records)));

        let disposer = Arc::new(DisposalQueue::new(config.disposal.queue_size)?);
        let factory = ArchiveFactory::new(
            Some(config.storage.data_dir.clone()),
            config.storage.engine,
            config.storage.long_id,
            config.storage.sync_writes,
            Arc::clone(&disposer),
            Arc::clone(&clock),
        );
        let staging = if config.storage.update_lower_resolution_archives {
            Some(Arc::new(StagingPipeline::open(
                &config.staging,
                config.staging_dir(),
                sorter,
                Arc::clone(&registry),
                Arc::clone(&index),
                aggregation,
                Arc::clone(&clock),
            )?))
        } else {
            None
        };

        let store = Arc::new(Store {
            cache: SeriesCache::new(config.query.cache_max_size, config.query.cache_ttl),
            cache_policy: QueryCachePolicy::new(config.query.cache_tiers.iter().cloned()),
            compaction_interval: config.storage.compaction_interval,
            registry,
            index,
            factory,
            staging,
            disposer,
            clock,
            counters: StoreCounters::default(),
            maintenance: Mutex::new(None),
        });
        if let Some(staging) = &store.staging {
            let sink: Arc<dyn PointSink> = Arc::clone(&store) as Arc<dyn PointSink>;
            staging.attach(Arc::downgrade(&sink));
        }
        tracing::info!(
            "Store open at {:?} with tiers {:?}",
            config.storage.data_dir,
            store.registry.all().iter().map(|p| p.name().to_string()).collect::<Vec<_>>()
        );
        Ok(store)
    }
}

/// Tiered time-series store.
pub struct Store {
    registry: Arc<PolicyRegistry>,
    index: Arc<dyn MetricIndex>,
    factory: ArchiveFactory,
    staging: Option<Arc<StagingPipeline>>,
    disposer: Arc<DisposalQueue>,
    cache: SeriesCache,
    cache_policy: QueryCachePolicy,
    clock: Arc<dyn Clock>,
    counters: StoreCounters,
    compaction_interval: Duration,
    maintenance: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("factory", &self.factory)
            .field("staging", &self.staging)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Builder over `config`.
    pub fn builder(config: Config) -> StoreBuilder {
        StoreBuilder {
            config,
            registry: None,
            index: None,
            aggregation: None,
            clock: None,
            sorter: None,
        }
    }

    /// Policy registry shared with the rest of the process.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Metric index the store resolves names with.
    pub fn index(&self) -> &Arc<dyn MetricIndex> {
        &self.index
    }

    /// Staging area, when propagation is enabled.
    pub fn staging(&self) -> Option<&Arc<StagingPipeline>> {
        self.staging.as_ref()
    }

    /// Current time as seen by the store.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Resolve raw points by metric and write them into their finest tier.
    pub fn insert(&self, points: Vec<DataPoint>) -> Result<usize> {
        self.insert_points(DataPoints::resolve(points, self.index.as_ref()))
    }

    fn archive_for(&self, policy: &Arc<RetentionPolicy>) -> Result<Arc<Archive>> {
        self.factory.archive(policy)
    }

    fn write_routed(&self, points: &DataPoints) -> Result<usize> {
        let now = self.clock.now();
        let mut tiers: BTreeMap<&str, &Arc<RetentionPolicy>> = BTreeMap::new();
        for routed in points.iter() {
            match &routed.policy {
                Some(policy) if routed.point.is_valid() => {
                    if !policy.includes(routed.point.ts, now) {
                        self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    }
                    tiers.insert(policy.db_name(), policy);
                },
                Some(_) => {},
                None => {
                    self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
        if tiers.is_empty() {
            tracing::debug!("No routed points in a batch of {}", points.len());
            return Ok(0);
        }

        let mut written = 0;
        for policy in tiers.values() {
            written += self.archive_for(policy)?.put_batch(points)?;
        }
        self.counters.inserted.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn stage_lower(&self, staging: &StagingPipeline, points: &DataPoints) {
        for routed in points.iter() {
            let point = &routed.point;
            if !point.is_valid() {
                continue;
            }
            let (Some(metric_id), Some(metric), Some(policy)) =
                (point.metric_id, &routed.metric, &routed.policy)
            else {
                continue;
            };
            let Some(next) = metric.next_lower_resolution(policy) else {
                continue;
            };
            let staged = staging.enqueue(
                next.db_name(),
                next.interval(point.ts),
                metric_id,
                point.value,
                Some(metric.name.as_str()),
            );
            if staged {
                self.counters.staged.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.staging_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Series of `metric` over `[from, until]` as of `now`.
    ///
    /// Served by the finest tier covering the window, aligned to its grid.
    /// Without such a tier the result is all gaps at the coarsest step.
    pub fn get_series(
        &self,
        metric: &Metric,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Series> {
        let Some(policy) = metric.pick_archive_for_query(from, until, now) else {
            return Ok(match metric.coarsest() {
                Some(coarsest) => Series::gaps(
                    metric.name.clone(),
                    coarsest.interval(from),
                    coarsest.interval(until),
                    coarsest.precision(),
                ),
                None => Series::gaps(metric.name.clone(), from, until, 0),
            });
        };

        if !self.cache_policy.is_cacheable(policy.db_name()) {
            return self.read_series(metric, policy, from, until);
        }
        let key = SeriesKey {
            metric_id: metric.id,
            from,
            until,
            now,
        };
        let series = self
            .cache
            .get_or_load(key, || self.read_series(metric, policy, from, until))?;
        Ok(Series::clone(&series))
    }

    fn read_series(
        &self,
        metric: &Metric,
        policy: &Arc<RetentionPolicy>,
        from: Timestamp,
        until: Timestamp,
    ) -> Result<Series> {
        self.counters.series_reads.fetch_add(1, Ordering::Relaxed);
        let start = policy.interval(from);
        let end = policy.interval(until);
        let step = policy.precision();
        let values = self
            .archive_for(policy)?
            .get_range_fixed_step(metric.id, start, end, step)?;
        Ok(Series {
            name: metric.name.clone(),
            start,
            end,
            step,
            values,
        })
    }

    /// Raw `(ts, value)` pairs of a metric on one tier.
    pub fn get_values(
        &self,
        db_name: &str,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<(Timestamp, f64)>> {
        let policy = self.registry.for_db_name(db_name)?;
        self.archive_for(&policy)?.get_range(metric_id, from, to)
    }

    /// First stored point of a metric on one tier.
    pub fn get_first(
        &self,
        db_name: &str,
        metric_id: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Option<(Timestamp, f64)>> {
        let policy = self.registry.for_db_name(db_name)?;
        self.archive_for(&policy)?.get_first(metric_id, from, to)
    }

    /// Load points straight into tier `db_name`.
    ///
    /// Each point needs a known metric and an aligned timestamp; failures are
    /// counted and the import aborts once they exceed `max_errors`. Points
    /// outside the tier's window count as expired.
    pub fn import_points(
        &self,
        db_name: &str,
        points: &[DataPoint],
        max_errors: usize,
    ) -> Result<ImportResults> {
        let policy = self.registry.for_db_name(db_name)?;
        let archive = self.archive_for(&policy)?;
        let now = self.clock.now();
        let mut results = ImportResults {
            db_name: db_name.to_string(),
            received: points.len(),
            ..ImportResults::default()
        };

        for point in points {
            match self.import_point(&archive, &policy, point, now) {
                Ok(true) => results.saved += 1,
                Ok(false) => results.expired += 1,
                Err(e) if e.is_recoverable() => {
                    results.errors += 1;
                    tracing::debug!("Failed to import {:?}: {}", point, e);
                    if results.errors > max_errors {
                        return Err(TierError::ImportErrorBudgetExceeded {
                            db_name: db_name.to_string(),
                            errors: results.errors,
                            max_allowed: max_errors,
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "Imported into {}: {} received, {} saved, {} errors, {} expired",
            db_name,
            results.received,
            results.saved,
            results.errors,
            results.expired
        );
        Ok(results)
    }

    fn import_point(
        &self,
        archive: &Archive,
        policy: &RetentionPolicy,
        point: &DataPoint,
        now: Timestamp,
    ) -> Result<bool> {
        let metric_id = match point.metric_id {
            Some(id) => id,
            None => self
                .index
                .for_name(&point.name)
                .map(|m| m.id)
                .ok_or_else(|| TierError::UnknownMetric(point.name.clone()))?,
        };
        if point.value.is_nan() {
            return Err(TierError::parse(format!("NaN value for {}", point.name)));
        }
        policy.assert_aligned(point.ts)?;
        if !policy.includes(point.ts, now) {
            return Ok(false);
        }
        archive.put(metric_id, point.ts, point.value)?;
        Ok(true)
    }

    /// Delete every record at the interval containing `ts` from tier `db_name`.
    pub fn delete(&self, db_name: &str, ts: Timestamp) -> Result<usize> {
        let policy = self.registry.for_db_name(db_name)?;
        self.archive_for(&policy)?.delete_interval(policy.interval(ts))
    }

    /// Delete all data of the given metrics from every tier of their chains.
    pub fn delete_metrics(&self, metrics: &[Arc<Metric>]) -> Result<usize> {
        let mut deleted = 0;
        for metric in metrics.iter().filter(|m| m.is_leaf()) {
            for policy in &metric.retention_policies {
                deleted += self.archive_for(policy)?.delete_metric(metric.id, None)?;
            }
        }
        Ok(deleted)
    }

    /// Collect and aggregate staged points now; see [`StagingPipeline::propagate`].
    pub fn propagate(&self, force: bool) -> Result<usize> {
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| TierError::config("propagation to lower tiers is disabled"))?;
        staging.sync(Duration::from_secs(30))?;
        let files = staging.propagate(force);
        staging.await_aggregation(Duration::from_secs(60));
        Ok(files.len())
    }

    /// Drop expired records from every open tier.
    pub fn compact(&self) -> usize {
        let removed = self.factory.compact_all();
        tracing::info!("Compaction removed {} expired records", removed);
        removed
    }

    /// Start periodic compaction and the staging schedules.
    pub fn start_maintenance(self: &Arc<Self>) -> Result<()> {
        if let Some(staging) = &self.staging {
            staging.start_schedules()?;
        }
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let store = Arc::downgrade(self);
        let every = self.compaction_interval;
        let handle = std::thread::Builder::new()
            .name("tierdb-compaction".into())
            .spawn(move || run_compaction(store, stop_rx, every))
            .map_err(|e| TierError::storage(format!("failed to start compaction thread: {e}")))?;
        *maintenance = Some((stop_tx, handle));
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> StoreStats {
        let (cache_hits, cache_misses) = self.cache.hit_stats();
        let c = &self.counters;
        StoreStats {
            inserted: c.inserted.load(Ordering::Relaxed),
            unrouted: c.unrouted.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            staged: c.staged.load(Ordering::Relaxed),
            staging_dropped: c.staging_dropped.load(Ordering::Relaxed),
            series_reads: c.series_reads.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            archives: self.factory.stats(),
            disposal: self.disposer.stats(),
            staging: self.staging.as_ref().map(|s| s.stats()),
        }
    }

    /// Log a statistics summary.
    pub fn dump_stats(&self) {
        let stats = self.stats();
        for archive in &stats.archives {
            tracing::info!(
                "Archive {}: written {}, deleted {}, expired {}, compacted {}, scans {}",
                archive.db_name,
                archive.written,
                archive.deleted,
                archive.expired_on_write,
                archive.compacted,
                archive.scans
            );
        }
        if let Some(staging) = &stats.staging {
            tracing::info!(
                "Staging: received {}, dropped {}, saved {}",
                staging.received,
                staging.dropped,
                staging.saved
            );
        }
        tracing::info!(
            "Series cache: {} hits, {} misses; disposal: {} disposed, {} discarded",
            stats.cache_hits,
            stats.cache_misses,
            stats.disposal.disposed,
            stats.disposal.discarded
        );
    }

    /// Stop background work, drain staging and close every tier. Idempotent.
    pub fn close(&self) {
        if let Some((stop, handle)) = self.maintenance.lock().take() {
            drop(stop);
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("Compaction thread panicked");
            }
        }
        if let Some(staging) = &self.staging {
            staging.shutdown();
        }
        self.factory.close_all();
        self.disposer.shutdown();
    }
}

impl PointSink for Store {
    /// Write points already routed to a tier and stage them for the next one.
    fn insert_points(&self, points: DataPoints) -> Result<usize> {
        let written = self.write_routed(&points)?;
        if let Some(staging) = &self.staging {
            self.stage_lower(staging, &points);
        }
        Ok(written)
    }
}

fn run_compaction(store: Weak<Store>, stop: Receiver<()>, every: Duration) {
    let ticker = tick(every);
    loop {
        let compact = select! {
            recv(stop) -> _ => false,
            recv(ticker) -> _ => true,
        };
        if !compact {
            break;
        }
        let Some(store) = store.upgrade() else {
            break;
        };
        store.compact();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConfigBuilder, ManualClock};
    use crate::staging::InMemorySort;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const NOW: Timestamp = 100_000_000;

    struct Fixture {
        _dir: TempDir,
        store: Arc<Store>,
        index: Arc<InMemoryMetricIndex>,
        clock: Arc<ManualClock>,
    }

    fn fixture(propagate: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .data_dir(dir.path().to_path_buf())
            .retention(["60s:24h", "5m:7d", "30m:2y"])
            .propagate(propagate)
            .build()
            .unwrap();
        let registry = Arc::new(PolicyRegistry::with_chain(&config.storage.retention).unwrap());
        let index = Arc::new(InMemoryMetricIndex::new(registry.all()));
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Store::builder(config)
            .registry(registry)
            .index(index.clone())
            .clock(clock.clone())
            .sorter(Arc::new(InMemorySort))
            .open()
            .unwrap();
        Fixture {
            _dir: dir,
            store,
            index,
            clock,
        }
    }

    #[test]
    fn test_insert_then_get_series() {
        let f = fixture(false);
        let metric = f.index.get_or_create("a.b.c").unwrap();
        let written = f
            .store
            .insert(vec![
                DataPoint::new("a.b.c", 1.0, NOW - 600),
                DataPoint::new("a.b.c", 2.0, NOW - 300),
                DataPoint::new("unknown..name", 3.0, NOW - 300),
            ])
            .unwrap();
        assert_eq!(written, 2);

        let series = f.store.get_series(&metric, NOW - 600, NOW - 300, NOW).unwrap();
        assert_eq!(series.step, 60);
        assert_eq!(series.start, NOW - 600 - (NOW - 600) % 60);
        assert_eq!(series.values.len(), 6);
        assert_eq!(series.present(), 2);
        assert_eq!(f.store.stats().unrouted, 1);
    }

    #[test]
    fn test_series_without_covering_tier_is_all_gaps() {
        let f = fixture(false);
        let metric = f.index.get_or_create("x").unwrap();
        // older than the two year tier
        let from = NOW - 70_000_000;
        let series = f.store.get_series(&metric, from, NOW, NOW).unwrap();
        assert_eq!(series.step, 1800);
        assert_eq!(series.present(), 0);
        assert!(!series.values.is_empty());
        assert_eq!(f.store.stats().series_reads, 0);
    }

    #[test]
    fn test_cacheable_tier_reads_are_memoized() {
        let f = fixture(false);
        let metric = f.index.get_or_create("cached").unwrap();
        f.store.get_series(&metric, NOW - 600, NOW, NOW).unwrap();
        f.store.get_series(&metric, NOW - 600, NOW, NOW).unwrap();
        let stats = f.store.stats();
        assert_eq!(stats.series_reads, 1);
        assert_eq!(stats.cache_hits, 1);

        // 5m7d is not cacheable
        f.store.get_series(&metric, NOW - 3 * 86_400, NOW, NOW).unwrap();
        f.store.get_series(&metric, NOW - 3 * 86_400, NOW, NOW).unwrap();
        assert_eq!(f.store.stats().series_reads, 3);
    }

    #[test]
    fn test_import_points() {
        let f = fixture(false);
        let metric = f.index.get_or_create("imp").unwrap();
        let aligned = NOW - NOW % 300;
        let points = vec![
            DataPoint::new("imp", 1.0, aligned).with_metric_id(metric.id),
            DataPoint::new("imp", 2.0, aligned - 300),
            DataPoint::new("imp", 3.0, aligned - 299),
            DataPoint::new("nope", 4.0, aligned),
            DataPoint::new("imp", 5.0, aligned - 30 * 86_400),
        ];
        let results = f.store.import_points("5m7d", &points, 2).unwrap();
        assert_eq!(
            results,
            ImportResults {
                db_name: "5m7d".into(),
                received: 5,
                saved: 2,
                errors: 2,
                expired: 1,
            }
        );
        assert_eq!(
            f.store.get_values("5m7d", metric.id, 0, NOW).unwrap(),
            vec![(aligned - 300, 2.0), (aligned, 1.0)]
        );

        let err = f.store.import_points("5m7d", &points, 1).unwrap_err();
        assert!(matches!(
            err,
            TierError::ImportErrorBudgetExceeded { errors: 2, max_allowed: 1, .. }
        ));
        assert!(matches!(
            f.store.import_points("1m1m", &points, 0),
            Err(TierError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_delete_interval_and_metrics() {
        let f = fixture(false);
        let a = f.index.get_or_create("del.a").unwrap();
        let b = f.index.get_or_create("del.b").unwrap();
        let ts = NOW - NOW % 60 - 120;
        f.store
            .insert(vec![
                DataPoint::new("del.a", 1.0, ts),
                DataPoint::new("del.a", 2.0, ts + 60),
                DataPoint::new("del.b", 3.0, ts),
            ])
            .unwrap();

        assert_eq!(f.store.delete("60s24h", ts + 5).unwrap(), 2);
        assert_eq!(f.store.get_values("60s24h", a.id, 0, NOW).unwrap(), vec![(ts + 60, 2.0)]);
        assert_eq!(f.store.delete_metrics(&[Arc::clone(&a)]).unwrap(), 1);
        assert!(f.store.get_values("60s24h", a.id, 0, NOW).unwrap().is_empty());
        assert!(f.store.get_first("60s24h", b.id, 0, NOW).unwrap().is_none());
    }

    #[test]
    fn test_propagation_into_lower_tiers() {
        let f = fixture(true);
        let metric = f.index.get_or_create("prop.x").unwrap();
        let base = NOW - NOW % 1800 - 1800;
        f.store
            .insert(vec![
                DataPoint::new("prop.x", 5.0, base + 60),
                DataPoint::new("prop.x", 9.0, base + 120),
                DataPoint::new("prop.x", 4.0, base + 300),
            ])
            .unwrap();
        assert_eq!(f.store.stats().staged, 3);

        // 60s -> 5m
        f.store.propagate(true).unwrap();
        assert_eq!(
            f.store.get_values("5m7d", metric.id, 0, NOW).unwrap(),
            vec![(base, 7.0), (base + 300, 4.0)]
        );
        // 5m -> 30m
        f.store.propagate(true).unwrap();
        assert_eq!(f.store.get_values("30m2y", metric.id, 0, NOW).unwrap(), vec![(base, 5.5)]);
        f.store.close();
    }

    #[test]
    fn test_compaction_follows_the_clock() {
        let f = fixture(false);
        f.index.get_or_create("old").unwrap();
        f.store.insert(vec![DataPoint::new("old", 1.0, NOW - 60)]).unwrap();
        assert_eq!(f.store.compact(), 0);

        f.clock.advance(2 * 86_400);
        assert_eq!(f.store.compact(), 1);
        let stats = f.store.stats();
        assert_eq!(stats.archives[0].compacted, 1);
    }

    #[test]
    fn test_propagate_disabled() {
        let f = fixture(false);
        assert!(f.store.staging().is_none());
        assert!(matches!(f.store.propagate(true), Err(TierError::Config(_))));
    }
}
