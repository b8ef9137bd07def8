//! Lazily opened, cached archives; one per tier.

use super::archive::{Archive, ArchiveOptions, ArchiveStats};
use super::disposal::DisposalQueue;
use crate::core::{Clock, EngineKind, Result};
use crate::retention::RetentionPolicy;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Opens each tier's archive on first use and hands out the shared instance.
#[derive(Debug)]
pub struct ArchiveFactory {
    root: Option<PathBuf>,
    engine: EngineKind,
    long_id: bool,
    sync_writes: bool,
    disposer: Arc<DisposalQueue>,
    clock: Arc<dyn Clock>,
    archives: DashMap<String, Arc<Archive>>,
}

impl ArchiveFactory {
    /// Factory rooted at `root`; `None` keeps every tier in memory.
    pub fn new(
        root: Option<PathBuf>,
        engine: EngineKind,
        long_id: bool,
        sync_writes: bool,
        disposer: Arc<DisposalQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root,
            engine,
            long_id,
            sync_writes,
            disposer,
            clock,
            archives: DashMap::new(),
        }
    }

    /// The archive for `policy`, opened on first call.
    pub fn archive(&self, policy: &Arc<RetentionPolicy>) -> Result<Arc<Archive>> {
        if let Some(archive) = self.archives.get(policy.db_name()) {
            return Ok(Arc::clone(archive.value()));
        }
        let entry = self
            .archives
            .entry(policy.db_name().to_string())
            .or_try_insert_with(|| {
                let options = ArchiveOptions {
                    dir: self.root.as_ref().map(|r| r.join(policy.db_name())),
                    engine: self.engine,
                    long_id: self.long_id,
                    sync_writes: self.sync_writes,
                };
                Archive::open(
                    Arc::clone(policy),
                    &options,
                    Arc::clone(&self.disposer),
                    Arc::clone(&self.clock),
                )
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Already opened archive for `db_name`, if any.
    pub fn opened(&self, db_name: &str) -> Option<Arc<Archive>> {
        self.archives.get(db_name).map(|a| Arc::clone(a.value()))
    }

    /// Run TTL compaction on every opened archive.
    pub fn compact_all(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|a| match a.compact() {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Compaction of {} failed: {}", a.db_name(), e);
                    0
                },
            })
            .sum()
    }

    /// Statistics of every opened archive, finest tier first.
    pub fn stats(&self) -> Vec<ArchiveStats> {
        self.snapshot().iter().map(|a| a.stats()).collect()
    }

    /// Close every opened archive.
    pub fn close_all(&self) {
        for archive in self.snapshot() {
            if let Err(e) = archive.close() {
                tracing::error!("Failed to close archive {}: {}", archive.db_name(), e);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Archive>> {
        let mut all: Vec<_> = self.archives.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.policy().cmp(b.policy()));
        all
    }
}
