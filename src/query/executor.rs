//! Fixed-size worker pool with a bounded backlog.
//!
//! Submitting to a full backlog blocks the caller until a slot frees up, so
//! bursts of queries are smoothed instead of rejected.

use crate::core::{Result, TierError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a task produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Cancelled before it started.
    Cancelled,
    /// The task panicked; carries the panic message.
    Panicked(String),
    /// The pool went away before the task ran.
    Lost,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "task cancelled"),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
            Self::Lost => write!(f, "task lost on executor shutdown"),
        }
    }
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: Receiver<std::result::Result<T, TaskFailure>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    /// Ask the task not to start. A running task is not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Wait for the task to finish.
    pub fn join(self) -> std::result::Result<T, TaskFailure> {
        self.result.recv().unwrap_or(Err(TaskFailure::Lost))
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    blocked: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
}

/// Executor statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    pub threads: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub blocked: u64,
    pub cancelled: u64,
    pub panicked: u64,
}

/// Bounded thread pool.
#[derive(Debug)]
pub struct BoundedExecutor {
    name: String,
    tx: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    counters: Arc<Counters>,
}

impl BoundedExecutor {
    /// Start `threads` workers sharing a backlog of `queue` tasks.
    pub fn new(name: &str, threads: usize, queue: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(queue);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })
                .map_err(|e| TierError::storage(format!("failed to start {name} worker: {e}")))?;
            workers.push(handle);
        }
        tracing::debug!("Started executor {} with {} threads, backlog {}", name, threads, queue);

        Ok(Self {
            name: name.to_string(),
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            threads,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Pool name, used as thread name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task`, blocking while the backlog is full.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let counters = Arc::clone(&self.counters);
        let job: Job = Box::new(move || {
            let outcome = if flag.load(Ordering::Acquire) {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(TaskFailure::Cancelled)
            } else {
                match catch_unwind(AssertUnwindSafe(task)) {
                    Ok(value) => Ok(value),
                    Err(panic) => {
                        counters.panicked.fetch_add(1, Ordering::Relaxed);
                        Err(TaskFailure::Panicked(panic_message(panic.as_ref())))
                    },
                }
            };
            counters.completed.fetch_add(1, Ordering::Relaxed);
            // the handle may have been dropped already
            let _ = result_tx.send(outcome);
        });

        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(TierError::Shutdown)?;
        match tx.try_send(job) {
            Ok(()) => {},
            Err(TrySendError::Full(job)) => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Executor {} backlog full, waiting", self.name);
                tx.send(job).map_err(|_| TierError::Shutdown)?;
            },
            Err(TrySendError::Disconnected(_)) => return Err(TierError::Shutdown),
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(TaskHandle {
            result: result_rx,
            cancelled,
        })
    }

    /// Current statistics.
    pub fn stats(&self) -> ExecutorStats {
        let c = &self.counters;
        ExecutorStats {
            threads: self.threads,
            queued: self.tx.read().as_ref().map_or(0, Sender::len),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            blocked: c.blocked.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    /// Run the backlog to completion and stop the workers. Idempotent.
    pub fn shutdown(&self) {
        drop(self.tx.write().take());
        let current = std::thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Worker of executor {} panicked", self.name);
            }
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runs_tasks() {
        let pool = BoundedExecutor::new("test", 2, 4).unwrap();
        let handles: Vec<_> = (0..10).map(|i| pool.submit(move || i * 2).unwrap()).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
    }

    #[test]
    fn test_full_backlog_blocks_submitter() {
        let pool = Arc::new(BoundedExecutor::new("blocking", 1, 1).unwrap());
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        let first = pool
            .submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = pool.submit(|| 2).unwrap(); // takes the only backlog slot

        let submitter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.submit(|| 3).unwrap().join().unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());

        release_tx.send(()).unwrap();
        first.join().unwrap();
        assert_eq!(second.join().unwrap(), 2);
        assert_eq!(submitter.join().unwrap(), 3);
        assert_eq!(pool.stats().blocked, 1);
    }

    #[test]
    fn test_panic_is_reported() {
        let pool = BoundedExecutor::new("panics", 1, 1).unwrap();
        let handle = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(handle.join(), Err(TaskFailure::Panicked("boom".into())));
        // the worker survives
        assert_eq!(pool.submit(|| 1).unwrap().join(), Ok(1));
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn test_cancelled_task_does_not_start() {
        let pool = BoundedExecutor::new("cancel", 1, 2).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let blocker = pool
            .submit(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_task = Arc::clone(&ran);
        let victim = pool.submit(move || ran_in_task.store(true, Ordering::SeqCst)).unwrap();
        victim.cancel();
        release_tx.send(()).unwrap();
        blocker.join().unwrap();
        assert_eq!(victim.join(), Err(TaskFailure::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = BoundedExecutor::new("closed", 1, 1).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| 1), Err(TierError::Shutdown)));
    }
}
