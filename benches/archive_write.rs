//! Archive write and key codec benchmarks.
//!
//! Run with: cargo bench --bench archive_write

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tierdb_lib::core::{Clock, DataPoint, DataPoints, EngineKind, ManualClock, Metric};
use tierdb_lib::retention::RetentionPolicy;
use tierdb_lib::storage::{Archive, ArchiveOptions, DisposalQueue, KeyCodec};

const NOW: u32 = 1_000_000;

fn bench_key_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_codec");
    for long_id in [false, true] {
        let codec = KeyCodec::new(long_id);
        group.bench_with_input(BenchmarkId::new("encode", long_id), &codec, |b, codec| {
            b.iter(|| codec.encode_key(black_box(42_424), black_box(NOW)).unwrap())
        });
        let key = codec.encode_key(42_424, NOW).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", long_id), &key, |b, key| {
            b.iter(|| codec.decode_key(black_box(key.as_ref())).unwrap())
        });
    }
    group.finish();
}

fn batch(policy: &Arc<RetentionPolicy>, metrics: u64) -> DataPoints {
    let mut points = DataPoints::with_capacity(metrics as usize);
    for id in 0..metrics {
        let metric = Arc::new(Metric::new(id, format!("bench.m{id}"), vec![Arc::clone(policy)]));
        let ts = policy.interval(NOW - (id as u32 % 600) * 60);
        points.push(
            DataPoint::new(metric.name.clone(), id as f64, ts),
            Some(metric),
            Some(Arc::clone(policy)),
        );
    }
    points
}

fn bench_put_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive_put_batch");
    let policy = Arc::new(RetentionPolicy::parse("60s:24h").unwrap());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let disposer = Arc::new(DisposalQueue::new(1024).unwrap());
    let archive = Archive::open(
        Arc::clone(&policy),
        &ArchiveOptions {
            dir: None,
            engine: EngineKind::Log,
            long_id: false,
            sync_writes: false,
        },
        disposer,
        clock,
    )
    .unwrap();

    for size in [100u64, 1_000, 10_000] {
        let points = batch(&policy, size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &points, |b, points| {
            b.iter(|| black_box(archive.put_batch(points).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_key_codec, bench_put_batch);
criterion_main!(benches);
