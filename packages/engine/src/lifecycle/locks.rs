// packages/engine/src/lifecycle/locks.rs
//! Per-workload operation locks
//!
//! Each key gets its own async mutex, created on first use. Acquisition
//! never waits: a held lock means another operation is in flight and the
//! caller gets [`EngineError::Conflict`] to retry later.

use crate::utils::errors::{EngineError, Result};
use crate::workload::WorkloadKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof that the holder owns a workload for the duration of an operation
pub type OperationGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<WorkloadKey, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the key's lock or fail with `Conflict`
    pub fn try_acquire(&self, key: &WorkloadKey) -> Result<OperationGuard> {
        let lock = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.try_lock_owned()
            .map_err(|_| EngineError::Conflict(key.name.clone()))
    }

    /// Drop the entry of a removed workload unless someone is using it
    pub fn forget(&self, key: &WorkloadKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let table = LockTable::new();
        let key = WorkloadKey::owned(1, "echo");

        let guard = table.try_acquire(&key).unwrap();
        assert!(matches!(table.try_acquire(&key), Err(EngineError::Conflict(_))));

        // other keys are independent
        assert!(table.try_acquire(&WorkloadKey::owned(2, "echo")).is_ok());

        drop(guard);
        assert!(table.try_acquire(&key).is_ok());
    }

    #[test]
    fn test_forget_skips_held_lock() {
        let table = LockTable::new();
        let key = WorkloadKey::global("echo");

        let guard = table.try_acquire(&key).unwrap();
        table.forget(&key);
        assert_eq!(table.len(), 1);

        drop(guard);
        table.forget(&key);
        assert!(table.is_empty());
    }
}
