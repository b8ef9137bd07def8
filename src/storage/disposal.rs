//! Background release of finished cursors and write batches.
//!
//! Tearing down engine handles can contend on engine-wide locks, so archives
//! hand them to this queue instead of dropping them on a request thread. The
//! queue is bounded; when it is full the handle is discarded (released right
//! away on the caller) and counted.

use crate::core::{Result, TierError};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Anything that can be released on another thread.
pub type Disposable = Box<dyn Send + 'static>;

#[derive(Debug, Default)]
struct Counters {
    disposed: AtomicU64,
    discarded: AtomicU64,
}

/// Bounded single-thread disposal executor.
#[derive(Debug)]
pub struct DisposalQueue {
    tx: RwLock<Option<Sender<Disposable>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

/// Disposal queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposalStats {
    pub pending: usize,
    pub disposed: u64,
    pub discarded: u64,
}

impl DisposalQueue {
    /// Start the queue with room for `capacity` pending handles.
    pub fn new(capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Disposable>(capacity);
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);
        let worker = std::thread::Builder::new()
            .name("tierdb-disposal".into())
            .spawn(move || {
                for item in rx {
                    drop(item);
                    worker_counters.disposed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .map_err(|e| TierError::storage(format!("failed to start disposal thread: {e}")))?;

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    /// Queue `item` for release. Never blocks.
    pub fn dispose<T: Send + 'static>(&self, item: T) {
        let boxed: Disposable = Box::new(item);
        let rejected = match self.tx.read().as_ref() {
            Some(tx) => match tx.try_send(boxed) {
                Ok(()) => return,
                Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => item,
            },
            None => boxed,
        };
        let discarded = self.counters.discarded.fetch_add(1, Ordering::Relaxed) + 1;
        if discarded == 1 || discarded % 10_000 == 0 {
            tracing::warn!("Disposal queue full, discarded {} handles so far", discarded);
        }
        drop(rejected);
    }

    /// Current statistics.
    pub fn stats(&self) -> DisposalStats {
        DisposalStats {
            pending: self.tx.read().as_ref().map_or(0, Sender::len),
            disposed: self.counters.disposed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Drain pending handles and stop the worker. Idempotent.
    pub fn shutdown(&self) {
        drop(self.tx.write().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Disposal thread panicked");
            }
        }
    }
}

impl Drop for DisposalQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
