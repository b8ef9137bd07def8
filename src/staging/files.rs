//! The set of open staging files: append with rotation, collection of idle
//! file-sets for sorting, startup recovery and stale file cleanup.

use super::file::StagingFile;
use super::file_set::FileSetId;
use super::record::StagingRecord;
use super::sort::Sorter;
use super::sorted::SortedStagingFile;
use crate::core::{Clock, Result, Timestamp};
use crate::retention::PolicyRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// How long a file-set must stay unmodified before it is collected.
///
/// Finer tiers are collected sooner to keep aggregation latency low.
#[derive(Debug, Clone, Default)]
pub struct CollectIdle {
    overrides: HashMap<String, Duration>,
}

impl CollectIdle {
    /// Defaults plus per-tier overrides.
    pub fn new(overrides: HashMap<String, Duration>) -> Self {
        Self { overrides }
    }

    /// Idle threshold for a tier of `precision` seconds.
    pub fn threshold(&self, db_name: &str, precision: Option<u32>) -> Duration {
        if let Some(idle) = self.overrides.get(db_name) {
            return *idle;
        }
        match precision {
            Some(p) if p <= 300 => Duration::from_secs(90),
            Some(p) if p <= 1800 => Duration::from_secs(5 * 60),
            _ => Duration::from_secs(20 * 60),
        }
    }
}

/// Open staging files keyed by file-set.
#[derive(Debug)]
pub struct StagingFiles {
    dir: PathBuf,
    files: DashMap<FileSetId, Arc<StagingFile>>,
    sorter: Arc<dyn Sorter>,
    registry: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    idle: CollectIdle,
    collecting: Mutex<()>,
}

impl StagingFiles {
    /// Open the staging directory and reopen file-sets whose newest unsorted
    /// file was never sorted.
    pub fn open(
        dir: PathBuf,
        sorter: Arc<dyn Sorter>,
        registry: Arc<PolicyRegistry>,
        clock: Arc<dyn Clock>,
        idle: CollectIdle,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let files = DashMap::new();
        let now = clock.now();
        for (set, seqs) in FileSetId::scan_dir(&dir)? {
            if seqs.is_incomplete() {
                tracing::info!("Reopening incomplete staging file-set {}", set);
                let file = StagingFile::open(&dir, set.clone(), seqs.last_unsorted, now)?;
                files.insert(set, Arc::new(file));
            }
        }
        Ok(Self {
            dir,
            files,
            sorter,
            registry,
            clock,
            idle,
            collecting: Mutex::new(()),
        })
    }

    /// Staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of file-sets with an open file.
    pub fn open_count(&self) -> usize {
        self.files.len()
    }

    /// Whether a file-set currently has an open file.
    pub fn is_open(&self, set: &FileSetId) -> bool {
        self.files.contains_key(set)
    }

    /// Append a record, rotating to the next sequence when the current file
    /// was closed for sorting in the meantime.
    pub fn write(&self, record: &StagingRecord) -> Result<()> {
        let now = self.clock.now();
        let current = match self.files.get(&record.file_set) {
            Some(file) => Arc::clone(file.value()),
            None => self.open_next(&record.file_set, now)?,
        };
        if current.write(record, now)? {
            return Ok(());
        }

        tracing::info!("Staging file of {} was closed, opening next sequence", record.file_set);
        let next = self.open_next(&record.file_set, now)?;
        if !next.write(record, now)? {
            tracing::error!(
                "Staging file of {} closed right after opening, skipping record {:?}",
                record.file_set,
                record
            );
        }
        Ok(())
    }

    fn open_next(&self, set: &FileSetId, now: Timestamp) -> Result<Arc<StagingFile>> {
        let seq = set.sequences(&self.dir)?.next();
        let file = Arc::new(StagingFile::open(&self.dir, set.clone(), seq, now)?);
        self.files.insert(set.clone(), Arc::clone(&file));
        Ok(file)
    }

    /// Close and sort every file-set of `db_name` that has been idle long
    /// enough, or all of them when `force` is set. Oldest intervals first.
    ///
    /// A file that fails to sort is logged and skipped.
    pub fn collect(&self, db_name: &str, force: bool) -> Vec<SortedStagingFile> {
        let _guard = self.collecting.lock();
        let now = self.clock.now();
        let precision = self.registry.for_db_name(db_name).ok().map(|p| p.precision());
        let idle = self.idle.threshold(db_name, precision).as_secs();

        let mut eligible: Vec<FileSetId> = self
            .files
            .iter()
            .filter(|e| e.key().db_name == db_name)
            .filter(|e| force || u64::from(now) > u64::from(e.value().last_modified()) + idle)
            .map(|e| e.key().clone())
            .collect();
        eligible.sort_by_key(|set| (set.from, set.shard));

        let mut sorted = Vec::with_capacity(eligible.len());
        for set in eligible {
            let Some((_, file)) = self.files.remove(&set) else {
                continue;
            };
            file.close();
            match self.sort_file(&set, &file) {
                Ok(out) => sorted.push(out),
                Err(e) => tracing::error!("Failed to sort staging file {:?}: {}", file.path(), e),
            }
        }
        tracing::debug!("Collected {} sorted files for {}", sorted.len(), db_name);
        sorted
    }

    fn sort_file(&self, set: &FileSetId, file: &StagingFile) -> Result<SortedStagingFile> {
        let seqs = set.sequences(&self.dir)?;
        let previous = (seqs.last_sorted > 0 && seqs.last_sorted < file.seq())
            .then(|| self.dir.join(set.sorted_name(seqs.last_sorted)));
        file.sort(self.sorter.as_ref(), previous)
    }

    /// Delete files last modified before `now - max_age` that are not open.
    pub fn delete_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = u64::from(self.clock.now()).saturating_sub(max_age.as_secs());
        let open: Vec<PathBuf> =
            self.files.iter().map(|e| e.value().path().to_path_buf()).collect();
        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            if modified >= cutoff {
                continue;
            }
            let path = entry.path();
            if open.contains(&path) {
                tracing::info!("Keeping old staging file {:?}, still in use", path);
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::info!("Deleted stale staging file {:?}", path);
                },
                Err(e) => tracing::error!("Failed to delete staging file {:?}: {}", path, e),
            }
        }
        Ok(deleted)
    }

    /// Flush every open file.
    pub fn flush(&self) -> Result<()> {
        for entry in self.files.iter() {
            entry.value().flush()?;
        }
        Ok(())
    }

    /// Close every open file; they are reopened on next start.
    pub fn close(&self) {
        for entry in self.files.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::staging::sort::InMemorySort;
    use tempfile::TempDir;

    const NOW: Timestamp = 2_000_000_000;

    fn files(dir: &TempDir, clock: Arc<ManualClock>) -> StagingFiles {
        let registry =
            Arc::new(PolicyRegistry::with_chain(&["60s:24h", "5m:7d", "30m:2y"]).unwrap());
        StagingFiles::open(
            dir.path().to_path_buf(),
            Arc::new(InMemorySort),
            registry,
            clock,
            CollectIdle::default(),
        )
        .unwrap()
    }

    fn record(db: &str, from: Timestamp, id: u64, value: f64) -> StagingRecord {
        StagingRecord {
            file_set: FileSetId::new(db, from, 0),
            metric_id: id,
            value,
            metric_name: None,
        }
    }

    #[test]
    fn test_idle_thresholds() {
        let idle = CollectIdle::new(HashMap::from([("5m7d".to_string(), Duration::from_secs(1))]));
        assert_eq!(idle.threshold("5m7d", Some(300)), Duration::from_secs(1));
        assert_eq!(idle.threshold("5m30d", Some(300)), Duration::from_secs(90));
        assert_eq!(idle.threshold("30m2y", Some(1800)), Duration::from_secs(300));
        assert_eq!(idle.threshold("1h5y", Some(3600)), Duration::from_secs(1200));
        assert_eq!(idle.threshold("unknown", None), Duration::from_secs(1200));
    }

    #[test]
    fn test_collects_only_idle_sets() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let files = files(&dir, Arc::clone(&clock));
        files.write(&record("5m7d", 0, 1, 1.0)).unwrap();
        files.write(&record("30m2y", 0, 1, 1.0)).unwrap();

        assert!(files.collect("5m7d", false).is_empty());
        clock.advance(91);
        let sorted = files.collect("5m7d", false);
        assert_eq!(sorted.len(), 1);
        assert!(!files.is_open(&FileSetId::new("5m7d", 0, 0)));
        assert!(files.is_open(&FileSetId::new("30m2y", 0, 0)));
        assert_eq!(files.collect("30m2y", true).len(), 1);
    }

    #[test]
    fn test_rotation_after_collection_merges_previous() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let files = files(&dir, clock);
        let set = FileSetId::new("5m7d", 0, 0);

        files.write(&record("5m7d", 0, 9, 1.0)).unwrap();
        let first = files.collect("5m7d", true);
        assert_eq!(first[0].path(), dir.path().join(set.sorted_name(1)));

        files.write(&record("5m7d", 0, 3, 2.0)).unwrap();
        let second = files.collect("5m7d", true);
        assert_eq!(second[0].path(), dir.path().join(set.sorted_name(2)));
        assert!(!dir.path().join(set.sorted_name(1)).exists());
        assert_eq!(std::fs::read_to_string(second[0].path()).unwrap(), "3 2\n9 1\n");
    }

    #[test]
    fn test_reopens_incomplete_sets_on_start() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        {
            let files = files(&dir, Arc::clone(&clock));
            files.write(&record("5m7d", 300, 4, 1.0)).unwrap();
            files.write(&record("5m7d", 600, 4, 1.0)).unwrap();
            files.collect("5m7d", true);
            files.write(&record("5m7d", 300, 4, 2.0)).unwrap();
            files.close();
        }
        let reopened = files(&dir, clock);
        assert_eq!(reopened.open_count(), 1);
        assert!(reopened.is_open(&FileSetId::new("5m7d", 300, 0)));
        reopened.write(&record("5m7d", 300, 4, 3.0)).unwrap();
        reopened.flush().unwrap();
        let content = std::fs::read_to_string(dir.path().join("5m7d-300-0.2")).unwrap();
        assert_eq!(content, "4 2\n4 3\n");
    }

    #[test]
    fn test_cleanup_keeps_open_files() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let files = files(&dir, Arc::clone(&clock));
        files.write(&record("5m7d", 0, 1, 1.0)).unwrap();
        files.write(&record("5m7d", 300, 1, 1.0)).unwrap();
        files.collect("5m7d", true);
        files.write(&record("5m7d", 600, 1, 1.0)).unwrap();

        // nothing is older than two hours yet
        let wall = std::time::SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        clock.set(u32::try_from(wall.as_secs()).unwrap());
        assert_eq!(files.delete_older_than(Duration::from_secs(7200)).unwrap(), 0);

        clock.advance(7300);
        // 2 unsorted + 2 sorted collected files go, the open one stays
        assert_eq!(files.delete_older_than(Duration::from_secs(7200)).unwrap(), 4);
        assert!(dir.path().join("5m7d-600-0.1").exists());
    }
}
