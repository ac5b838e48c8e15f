// packages/engine/src/runtime/worker_pool.rs
//! Bounded worker pool for lifecycle commands
//!
//! Fetch, build and launch are slow, so each command runs as its own tokio
//! task. A semaphore caps how many run at once; extra submissions wait for
//! a free slot (backpressure) instead of piling up host processes.
//!
//! ```text
//! WorkerPool
//! ├─ Permits: [slot, slot, ...]   (max_concurrent)
//! ├─ Busy:    [deploy a, stop b]  (holding a permit)
//! └─ Waiters: [update c, ...]     (queued for a permit)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Operations allowed to run concurrently (default: 8)
    pub max_concurrent: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

/// Worker pool running lifecycle operations on the tokio runtime
#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    submitted: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_config(WorkerPoolConfig {
            max_concurrent: max_concurrent.max(1),
        })
    }

    /// Create a worker pool with custom configuration
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        debug!("Initializing worker pool with {} slots", config.max_concurrent);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            submitted: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `task` once a slot is free. The returned handle resolves to the
    /// task's output, or a `JoinError` if it panicked.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let completed = Arc::clone(&self.completed);
        self.submitted.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            // closed only if the pool is torn down; run anyway
            let permit = semaphore.acquire_owned().await;
            if permit.is_err() {
                warn!("worker pool semaphore closed, running task without a slot");
            }
            let output = task.await;
            completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
            output
        })
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self.semaphore.available_permits();
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        PoolStats {
            max_concurrent: self.config.max_concurrent,
            available_slots: available,
            busy_slots: self.config.max_concurrent.saturating_sub(available),
            submitted,
            completed,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub busy_slots: usize,
    pub submitted: u64,
    pub completed: u64,
}
