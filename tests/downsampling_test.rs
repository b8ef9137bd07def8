//! End-to-end downsampling through the staging area.

mod common;

use common::{points, TestStoreBuilder};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use tierdb_lib::core::{Clock, DataPoint, InMemoryMetricIndex, ManualClock, Metric};
use tierdb_lib::retention::PolicyRegistry;
use tierdb_lib::staging::{CollectIdle, ExternalSort, FileSetId, StagingFiles, StagingRecord};

#[test]
fn test_two_points_average_into_lower_tier() {
    let t = TestStoreBuilder::new().build();
    t.metric(7, "app.latency");

    let written = t
        .store
        .insert(points("app.latency", &[(120, 5.0), (150, 9.0)]))
        .unwrap();
    assert_eq!(written, 2);
    // both land in the same 60s interval, last write wins there
    assert_eq!(t.store.get_values("60s24h", 7, 0, 10_000).unwrap(), vec![(120, 9.0)]);

    t.store.propagate(true).unwrap();
    assert_eq!(t.store.get_values("5m7d", 7, 0, 10_000).unwrap(), vec![(0, 7.0)]);
}

#[test]
fn test_rules_pick_method_per_metric() {
    let t = TestStoreBuilder::new()
        .rules(&[r"sum = \.count$", "avg = *"])
        .build();
    t.metric(1, "web.requests.count");
    t.metric(2, "web.latency");

    let mut batch = points("web.requests.count", &[(0, 10.0), (60, 20.0), (120, 30.0)]);
    batch.extend(points("web.latency", &[(0, 10.0), (60, 20.0), (120, 30.0)]));
    t.store.insert(batch).unwrap();
    t.store.propagate(true).unwrap();

    assert_eq!(t.store.get_values("5m7d", 1, 0, 10_000).unwrap(), vec![(0, 60.0)]);
    assert_eq!(t.store.get_values("5m7d", 2, 0, 10_000).unwrap(), vec![(0, 20.0)]);
}

#[test]
fn test_late_points_recompute_the_interval() {
    let t = TestStoreBuilder::new().build();
    t.metric(3, "late.metric");

    t.store.insert(points("late.metric", &[(0, 2.0), (60, 4.0)])).unwrap();
    t.store.propagate(true).unwrap();
    assert_eq!(t.store.get_values("5m7d", 3, 0, 10_000).unwrap(), vec![(0, 3.0)]);

    // arrives after the interval was already aggregated
    t.store.insert(points("late.metric", &[(120, 9.0)])).unwrap();
    t.store.propagate(true).unwrap();
    assert_eq!(t.store.get_values("5m7d", 3, 0, 10_000).unwrap(), vec![(0, 5.0)]);
}

#[test]
fn test_expired_top_tier_points_still_feed_lower_tiers() {
    let now = 200_000;
    let t = TestStoreBuilder::new().now(now).build();
    t.metric(4, "old.metric");

    // outside 24h, inside 7d
    let written = t.store.insert(points("old.metric", &[(600, 1.0), (660, 3.0)])).unwrap();
    assert_eq!(written, 0);
    assert_eq!(t.store.stats().expired, 2);

    t.store.propagate(true).unwrap();
    assert_eq!(t.store.get_values("5m7d", 4, 0, now).unwrap(), vec![(600, 2.0)]);
}

#[test]
fn test_staged_points_survive_restart() {
    let t = TestStoreBuilder::new().build();
    t.metric(5, "restart.metric");
    t.store.insert(points("restart.metric", &[(0, 1.0), (60, 5.0)])).unwrap();
    let dir = t.close();

    let t = TestStoreBuilder::new().dir(dir).build();
    t.metric(5, "restart.metric");
    assert_eq!(t.store.get_values("60s24h", 5, 0, 10_000).unwrap(), vec![(0, 1.0), (60, 5.0)]);
    t.store.propagate(true).unwrap();
    assert_eq!(t.store.get_values("5m7d", 5, 0, 10_000).unwrap(), vec![(0, 3.0)]);
}

#[test]
fn test_unsorted_files_merge_into_one_group() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(10_000));
    let registry = Arc::new(PolicyRegistry::with_chain(&["60s:24h", "5m:7d"]).unwrap());
    let index = InMemoryMetricIndex::new(registry.chain("60s:24h,5m:7d").unwrap());
    index.insert(Metric::new(9, "merge.metric", registry.chain("60s:24h,5m:7d").unwrap()));
    index.insert(Metric::new(2, "other.metric", registry.chain("60s:24h,5m:7d").unwrap()));

    let files = StagingFiles::open(
        dir.path().to_path_buf(),
        // tiny runs force the external merge path
        Arc::new(ExternalSort::new(2)),
        registry,
        Arc::clone(&clock) as Arc<dyn Clock>,
        CollectIdle::default(),
    )
    .unwrap();
    let record = |id: u64, value: f64| StagingRecord {
        file_set: FileSetId::new("5m7d", 0, 1),
        metric_id: id,
        value,
        metric_name: None,
    };

    for (id, value) in [(9, 3.0), (2, 100.0), (9, 1.0)] {
        files.write(&record(id, value)).unwrap();
    }
    let first = files.collect("5m7d", true);
    assert_eq!(first.len(), 1);

    for (id, value) in [(9, 4.0), (9, 2.0)] {
        files.write(&record(id, value)).unwrap();
    }
    let mut merged = files.collect("5m7d", true);
    assert_eq!(merged.len(), 1);
    let mut sorted = merged.remove(0);
    sorted.open().unwrap();

    let other = sorted.next_group(&index).unwrap().unwrap();
    assert_eq!(other.metric.id, 2);
    assert_eq!(other.values, vec![100.0]);

    let group = sorted.next_group(&index).unwrap().unwrap();
    assert_eq!(group.metric.id, 9);
    assert_eq!(group.interval, 0);
    assert_eq!(group.db_name, "5m7d");
    let mut values = group.values.clone();
    values.sort_by(f64::total_cmp);
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);

    assert!(sorted.next_group(&index).unwrap().is_none());
    sorted.close();
    files.close();
}

#[test]
fn test_disabled_propagation_writes_top_tier_only() {
    let t = TestStoreBuilder::new().propagate(false).build();
    t.metric(6, "solo");
    t.store.insert(vec![DataPoint::new("solo", 1.0, 60)]).unwrap();
    assert_eq!(t.store.stats().staged, 0);
    assert!(t.store.get_values("5m7d", 6, 0, 10_000).unwrap().is_empty());
}
