//! Seam to the metric name index.
//!
//! The storage core never creates or deletes metrics on its own; it looks them
//! up through [`MetricIndex`]. [`InMemoryMetricIndex`] is a small index used by
//! the admin CLI and the tests.

use crate::core::{Metric, Result, TierError};
use crate::retention::RetentionPolicy;
use dashmap::DashMap;
use regex::Regex;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lookup contract the storage core relies on.
pub trait MetricIndex: Send + Sync {
    /// Metric by numeric id, used when re-hydrating staged records.
    fn for_id(&self, id: u64) -> Option<Arc<Metric>>;

    /// Metric by name.
    fn for_name(&self, name: &str) -> Option<Arc<Metric>>;

    /// Metrics matching a query pattern, sorted by name.
    fn find_metrics(&self, pattern: &str) -> Vec<Arc<Metric>>;
}

/// Concurrent in-process index.
#[derive(Debug)]
pub struct InMemoryMetricIndex {
    by_id: DashMap<u64, Arc<Metric>>,
    by_name: DashMap<String, Arc<Metric>>,
    next_id: AtomicU64,
    default_policies: Vec<Arc<RetentionPolicy>>,
}

impl InMemoryMetricIndex {
    /// Index that assigns `default_policies` to metrics created by name.
    pub fn new(default_policies: Vec<Arc<RetentionPolicy>>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_policies,
        }
    }

    /// Register a metric with an explicit id.
    pub fn insert(&self, metric: Metric) -> Arc<Metric> {
        let metric = Arc::new(metric);
        self.next_id.fetch_max(metric.id + 1, Ordering::Relaxed);
        self.by_id.insert(metric.id, Arc::clone(&metric));
        self.by_name.insert(metric.name.clone(), Arc::clone(&metric));
        metric
    }

    /// Look up a leaf metric by name, creating it with the default chain.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Metric>> {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') {
            return Err(TierError::UnknownMetric(name.to_string()));
        }
        if let Some(m) = self.by_name.get(name) {
            return Ok(Arc::clone(m.value()));
        }
        let metric = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(Metric::new(id, name, self.default_policies.clone()))
            })
            .clone();
        self.by_id.insert(metric.id, Arc::clone(&metric));
        Ok(metric)
    }

    /// Index from an `id name` per line file; a missing file gives an empty index.
    pub fn load(path: &Path, default_policies: Vec<Arc<RetentionPolicy>>) -> Result<Self> {
        let index = Self::new(default_policies);
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (id, name) = line
                .split_once(' ')
                .and_then(|(id, name)| Some((id.parse::<u64>().ok()?, name)))
                .ok_or_else(|| {
                    let at = format!("{}:{}", path.display(), n + 1);
                    TierError::corrupt(format!("{at}: bad index line {line:?}"))
                })?;
            index.insert(Metric::new(id, name, index.default_policies.clone()));
        }
        tracing::debug!("Loaded {} metrics from {:?}", index.len(), path);
        Ok(index)
    }

    /// Write the index in the format [`load`](Self::load) reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut metrics: Vec<Arc<Metric>> =
            self.by_id.iter().map(|e| Arc::clone(e.value())).collect();
        metrics.sort_by_key(|m| m.id);
        let mut out = String::new();
        for m in &metrics {
            let _ = writeln!(out, "{} {}", m.id, m.name);
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl MetricIndex for InMemoryMetricIndex {
    fn for_id(&self, id: u64) -> Option<Arc<Metric>> {
        self.by_id.get(&id).map(|m| Arc::clone(m.value()))
    }

    fn for_name(&self, name: &str) -> Option<Arc<Metric>> {
        self.by_name.get(name).map(|m| Arc::clone(m.value()))
    }

    fn find_metrics(&self, pattern: &str) -> Vec<Arc<Metric>> {
        let mut found: Vec<Arc<Metric>> = if pattern.contains('*') {
            let Ok(re) = glob_to_regex(pattern) else {
                return Vec::new();
            };
            self.by_name
                .iter()
                .filter(|e| re.is_match(e.key()))
                .map(|e| Arc::clone(e.value()))
                .collect()
        } else {
            self.for_name(pattern).into_iter().collect()
        };
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

/// `*` matches within one dotted segment.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", "[^.]*");
    Regex::new(&format!("^{escaped}$"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> InMemoryMetricIndex {
        let policies = RetentionPolicy::parse_list("60s:24h,5m:7d")
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();
        InMemoryMetricIndex::new(policies)
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let index = index();
        let a = index.get_or_create("pod1.cpu.user").unwrap();
        let b = index.get_or_create("pod1.cpu.user").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(index.for_id(a.id).unwrap().name, "pod1.cpu.user");
        assert!(index.get_or_create("bad.").is_err());
    }

    #[test]
    fn test_explicit_ids_do_not_collide() {
        let index = index();
        index.insert(Metric::new(42, "fixed", Vec::new()));
        let created = index.get_or_create("created").unwrap();
        assert!(created.id > 42);
    }

    #[test]
    fn test_find_metrics_glob_within_segment() {
        let index = index();
        for name in ["a.x.cpu", "a.y.cpu", "a.x.y.cpu", "b.x.cpu"] {
            index.get_or_create(name).unwrap();
        }
        let names: Vec<String> = index
            .find_metrics("a.*.cpu")
            .iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(names, vec!["a.x.cpu", "a.y.cpu"]);
        assert_eq!(index.find_metrics("b.x.cpu").len(), 1);
        assert!(index.find_metrics("nope").is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.idx");
        assert!(InMemoryMetricIndex::load(&path, Vec::new()).unwrap().is_empty());

        let index = index();
        let a = index.get_or_create("pod1.cpu").unwrap();
        let b = index.get_or_create("pod2.cpu").unwrap();
        index.save(&path).unwrap();

        let loaded = InMemoryMetricIndex::load(&path, index.default_policies.clone()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.for_name("pod1.cpu").unwrap().id, a.id);
        assert_eq!(loaded.for_id(b.id).unwrap().retention_policies.len(), 2);
        assert!(loaded.get_or_create("pod3.cpu").unwrap().id > b.id);

        std::fs::write(&path, "x pod1.cpu\n").unwrap();
        assert!(matches!(
            InMemoryMetricIndex::load(&path, Vec::new()),
            Err(TierError::Corrupt(_))
        ));
    }
}
