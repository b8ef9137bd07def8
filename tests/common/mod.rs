//! Common test utilities and fixtures.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tierdb_lib::core::{
    Config, ConfigBuilder, DataPoint, InMemoryMetricIndex, ManualClock, Metric, Result, Series,
    Timestamp,
};
use tierdb_lib::query::SeriesReader;
use tierdb_lib::retention::PolicyRegistry;
use tierdb_lib::staging::InMemorySort;
use tierdb_lib::storage::Store;

/// Store over a temporary directory with a manual clock.
///
/// Fields drop in order, so the store goes away before its directory.
pub struct TestStore {
    pub store: Arc<Store>,
    pub index: Arc<InMemoryMetricIndex>,
    pub registry: Arc<PolicyRegistry>,
    pub clock: Arc<ManualClock>,
    pub config: Config,
    pub dir: TempDir,
}

/// Builder for [`TestStore`] with sensible defaults.
pub struct TestStoreBuilder {
    retention: Vec<String>,
    rules: Vec<String>,
    propagate: bool,
    now: Timestamp,
    max_points: u64,
    heavy_threshold: u64,
    dir: Option<TempDir>,
}

impl TestStoreBuilder {
    pub fn new() -> Self {
        Self {
            retention: vec!["60s:24h".into(), "5m:7d".into()],
            rules: vec!["avg = *".into()],
            propagate: true,
            now: 10_000,
            max_points: 20_000_000,
            heavy_threshold: 10_000 * 24 * 60,
            dir: None,
        }
    }

    pub fn retention(mut self, chain: &[&str]) -> Self {
        self.retention = chain.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn rules(mut self, rules: &[&str]) -> Self {
        self.rules = rules.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn propagate(mut self, enable: bool) -> Self {
        self.propagate = enable;
        self
    }

    pub fn now(mut self, now: Timestamp) -> Self {
        self.now = now;
        self
    }

    pub fn query_limits(mut self, max_points: u64, heavy_threshold: u64) -> Self {
        self.max_points = max_points;
        self.heavy_threshold = heavy_threshold;
        self
    }

    /// Reuse the directory of a previously closed store.
    pub fn dir(mut self, dir: TempDir) -> Self {
        self.dir = Some(dir);
        self
    }

    pub fn build(self) -> TestStore {
        let dir = self.dir.unwrap_or_else(|| TempDir::new().unwrap());
        let config = ConfigBuilder::new()
            .data_dir(dir.path().to_path_buf())
            .retention(self.retention.clone())
            .propagate(self.propagate)
            .aggregation_rules(self.rules.clone())
            .query_limits(self.max_points, self.heavy_threshold)
            .build()
            .unwrap();
        let registry = Arc::new(PolicyRegistry::with_chain(&self.retention).unwrap());
        let index = Arc::new(InMemoryMetricIndex::new(
            registry.chain(&self.retention.join(",")).unwrap(),
        ));
        let clock = Arc::new(ManualClock::new(self.now));
        let store = Store::builder(config.clone())
            .registry(Arc::clone(&registry))
            .index(Arc::clone(&index) as Arc<dyn tierdb_lib::core::MetricIndex>)
            .clock(Arc::clone(&clock) as Arc<dyn tierdb_lib::core::Clock>)
            .sorter(Arc::new(InMemorySort))
            .open()
            .unwrap();
        TestStore {
            store,
            index,
            registry,
            clock,
            config,
            dir,
        }
    }
}

impl TestStore {
    /// Register `name` under an explicit id with the store's chain.
    pub fn metric(&self, id: u64, name: &str) -> Arc<Metric> {
        let chain = self
            .registry
            .chain(&self.config.storage.retention.join(","))
            .unwrap();
        self.index.insert(Metric::new(id, name, chain))
    }

    /// Close the store and hand back its directory.
    pub fn close(self) -> TempDir {
        self.store.close();
        self.dir
    }
}

/// Points of one metric.
pub fn points(name: &str, samples: &[(Timestamp, f64)]) -> Vec<DataPoint> {
    samples
        .iter()
        .map(|&(ts, value)| DataPoint::new(name, value, ts))
        .collect()
}

/// Delegates to a store and counts every series read.
pub struct CountingReader {
    pub inner: Arc<Store>,
    pub reads: AtomicU64,
}

impl CountingReader {
    pub fn new(inner: Arc<Store>) -> Self {
        Self {
            inner,
            reads: AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SeriesReader for CountingReader {
    fn read_series(
        &self,
        metric: &Metric,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Series> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_series(metric, from, until, now)
    }
}
