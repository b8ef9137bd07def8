//! Short-lived memo of fixed-step reads.
//!
//! Entries are keyed by `(metric, from, until, now)`. Because `now` moves on
//! every request, entries are never invalidated; they simply stop being hit
//! and age out by TTL or LRU order.

use crate::core::{Series, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which tiers get their reads cached.
#[derive(Debug, Clone, Default)]
pub struct QueryCachePolicy {
    tiers: HashSet<String>,
}

impl QueryCachePolicy {
    /// Cache reads served by the named tiers.
    pub fn new<I, S>(tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tiers: tiers.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether reads from `db_name` are cached.
    pub fn is_cacheable(&self, db_name: &str) -> bool {
        self.tiers.contains(db_name)
    }
}

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub metric_id: u64,
    pub from: Timestamp,
    pub until: Timestamp,
    pub now: Timestamp,
}

/// Bounded LRU of series with a per-entry lifetime.
#[derive(Debug)]
pub struct SeriesCache {
    entries: Mutex<LruCache<SeriesKey, (Instant, Arc<Series>)>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SeriesCache {
    /// Cache holding at most `capacity` series for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached series, or the result of `load` which is then cached.
    pub fn get_or_load<E>(
        &self,
        key: SeriesKey,
        load: impl FnOnce() -> Result<Series, E>,
    ) -> Result<Arc<Series>, E> {
        {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some((at, series)) if at.elapsed() < self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(series));
                },
                Some(_) => {
                    entries.pop(&key);
                },
                None => {},
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        // loaded outside the lock; concurrent misses on one key both read
        let series = Arc::new(load()?);
        self.entries
            .lock()
            .put(key, (Instant::now(), Arc::clone(&series)));
        Ok(series)
    }

    /// `(hits, misses)`.
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn key(now: Timestamp) -> SeriesKey {
        SeriesKey {
            metric_id: 1,
            from: 0,
            until: 600,
            now,
        }
    }

    fn load(counter: &AtomicU64) -> Result<Series, Infallible> {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(Series::gaps("m", 0, 600, 60))
    }

    #[test]
    fn test_hits_within_ttl() {
        let cache = SeriesCache::new(10, Duration::from_secs(30));
        let loads = AtomicU64::new(0);
        cache.get_or_load(key(100), || load(&loads)).unwrap();
        cache.get_or_load(key(100), || load(&loads)).unwrap();
        assert_eq!(loads.load(Ordering::Relaxed), 1);
        assert_eq!(cache.hit_stats(), (1, 1));

        // a different `now` is a different entry
        cache.get_or_load(key(101), || load(&loads)).unwrap();
        assert_eq!(loads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_expired_entries_reload() {
        let cache = SeriesCache::new(10, Duration::ZERO);
        let loads = AtomicU64::new(0);
        cache.get_or_load(key(1), || load(&loads)).unwrap();
        cache.get_or_load(key(1), || load(&loads)).unwrap();
        assert_eq!(loads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_bounded_size() {
        let cache = SeriesCache::new(2, Duration::from_secs(30));
        let loads = AtomicU64::new(0);
        for now in 0..5 {
            cache.get_or_load(key(now), || load(&loads)).unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = SeriesCache::new(2, Duration::from_secs(30));
        let failed: Result<Arc<Series>, &str> = cache.get_or_load(key(1), || Err("boom"));
        assert!(failed.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_policy() {
        let policy = QueryCachePolicy::new(["60s24h", "60s30d"]);
        assert!(policy.is_cacheable("60s24h"));
        assert!(!policy.is_cacheable("5m7d"));
    }
}
