//! Ordered key-value engines backing the archives.
//!
//! Archives only need ordered point reads and writes, atomic batches, forward
//! scans and a TTL sweep. [`LogEngine`] is the built-in engine; with the
//! `persistent` feature a RocksDB engine opened with TTL is available too.

mod batch_log;
#[cfg(feature = "persistent")]
mod rocks;

pub use self::batch_log::LogEngine;
#[cfg(feature = "persistent")]
pub use self::rocks::RocksEngine;

use crate::core::Result;
use serde::{Deserialize, Serialize};

/// A key with its value.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Insert or overwrite
    Put(Vec<u8>, Vec<u8>),
    /// Remove
    Delete(Vec<u8>),
}

/// Operations committed atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()));
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    /// Queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume into the raw operations.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Storage engine contract.
///
/// Implementations do their own internal locking and are shared between
/// reader and writer threads.
pub trait KvEngine: Send + Sync + std::fmt::Debug {
    /// Single key lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Single key write.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Single key delete.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Commit all operations of `batch` or none of them.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Forward scan in key order from `from` (inclusive) to the end of the
    /// keyspace. `chunk` hints how many pairs to fetch at a time.
    fn scan(&self, from: Option<&[u8]>, chunk: usize) -> Result<Cursor>;

    /// Drop records older than the TTL; returns how many went away when known.
    fn compact(&self) -> Result<usize>;

    /// Make buffered writes durable.
    fn flush(&self) -> Result<()>;

    /// Flush and release resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Owned forward scan handed out by [`KvEngine::scan`].
///
/// A cursor owns whatever native iterator backs it and borrows nothing from
/// the engine, so a finished cursor can be handed to the disposal queue and
/// its teardown happens there.
pub struct Cursor {
    inner: Box<dyn Iterator<Item = Result<KvPair>> + Send>,
}

impl Cursor {
    /// Wrap an engine specific iterator.
    pub fn new<I>(inner: I) -> Self
    where
        I: Iterator<Item = Result<KvPair>> + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

impl Iterator for Cursor {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
