//! RocksDB engine opened in TTL mode; records older than the tier retention
//! are dropped by RocksDB compactions.

use super::{BatchOp, Cursor, KvEngine, KvPair, WriteBatch};
use crate::core::{Result, TierError};
use parking_lot::RwLock;
use rocksdb::{DBRawIteratorWithThreadMode, Options, WriteOptions, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// RocksDB-backed engine.
pub struct RocksEngine {
    db: RwLock<Option<Arc<DB>>>,
    path: PathBuf,
    sync: bool,
}

impl std::fmt::Debug for RocksEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksEngine")
            .field("path", &self.path)
            .field("sync", &self.sync)
            .field("open", &self.db.read().is_some())
            .finish()
    }
}

impl RocksEngine {
    /// Open (or create) a TTL database at `dir`. With `sync` every write waits
    /// for the WAL to reach the disk.
    pub fn open(dir: &Path, ttl: u32, sync: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open_with_ttl(&opts, dir, Duration::from_secs(u64::from(ttl)))
            .map_err(|e| TierError::storage(format!("failed to open {:?}: {}", dir, e)))?;
        tracing::info!("Opened RocksDB archive at {:?} with ttl {}s", dir, ttl);
        Ok(Self {
            db: RwLock::new(Some(Arc::new(db))),
            path: dir.to_path_buf(),
            sync,
        })
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&DB) -> std::result::Result<T, rocksdb::Error>,
    ) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(TierError::Shutdown)?;
        f(db).map_err(|e| TierError::storage(e.to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync);
        opts
    }
}

impl KvEngine for RocksEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| db.get(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let opts = self.write_options();
        self.with_db(|db| db.put_opt(key, value, &opts))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let opts = self.write_options();
        self.with_db(|db| db.delete_opt(key, &opts))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut native = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => native.put(k, v),
                BatchOp::Delete(k) => native.delete(k),
            }
        }
        let opts = self.write_options();
        self.with_db(|db| db.write_opt(native, &opts))
    }

    fn scan(&self, from: Option<&[u8]>, _chunk: usize) -> Result<Cursor> {
        let db = self.db.read().clone().ok_or(TierError::Shutdown)?;
        Ok(Cursor::new(RocksScan::new(db, from)))
    }

    fn compact(&self) -> Result<usize> {
        self.with_db(|db| {
            db.compact_range(None::<&[u8]>, None::<&[u8]>);
            Ok(0)
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_db(|db| db.flush())
    }

    fn close(&self) -> Result<()> {
        if let Some(db) = self.db.write().take() {
            db.flush()
                .map_err(|e| TierError::storage(format!("flush on close failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Forward scan over one native iterator. The cursor owns the iterator and a
/// handle on the database, so whoever drops the cursor pays for releasing the
/// iterator and, after `close`, the database itself.
struct RocksScan {
    // Declared before `_db`: the iterator must be released first.
    raw: DBRawIteratorWithThreadMode<'static, DB>,
    _db: Arc<DB>,
    started: bool,
    done: bool,
}

impl RocksScan {
    fn new(db: Arc<DB>, from: Option<&[u8]>) -> Self {
        // SAFETY: the iterator borrows the database behind the `Arc` held in
        // `_db`. That allocation does not move and outlives the iterator,
        // which is dropped first.
        let target: &'static DB = unsafe { &*Arc::as_ptr(&db) };
        let mut raw = target.raw_iterator();
        match from {
            Some(key) => raw.seek(key),
            None => raw.seek_to_first(),
        }
        Self {
            raw,
            _db: db,
            started: false,
            done: false,
        }
    }
}

impl Iterator for RocksScan {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.started {
            self.raw.next();
        }
        self.started = true;
        if let (Some(k), Some(v)) = (self.raw.key(), self.raw.value()) {
            return Some(Ok((k.to_vec(), v.to_vec())));
        }
        self.done = true;
        match self.raw.status() {
            Ok(()) => None,
            Err(e) => Some(Err(TierError::storage(e.to_string()))),
        }
    }
}
