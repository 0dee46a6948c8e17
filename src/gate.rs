// SPDX-License-Identifier: MIT
//! Concurrency Gate — per-task mutual exclusion plus a global ceiling on
//! simultaneously running executions.
//!
//! The per-task lock is an awaitable, non-reentrant `tokio::sync::Mutex`
//! handed out as an owned guard covering the admission decision: check the
//! running set, claim a slot, spawn. It is released once the start verdict
//! is reached; a live execution is signalled by the running set alone. The
//! running set backs the double-check protocol: a task already in the set is
//! never started again, and inserting past the ceiling fails with a
//! caller-visible `CapacityExceeded`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, TaskError};

pub struct ConcurrencyGate {
    /// task id -> start lock. Entries are created lazily and reclaimed by
    /// `purge_idle_locks` once nothing holds or awaits them.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    running: Mutex<HashSet<String>>,
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Acquire the exclusive start lock for a task. Only one caller holds it
    /// at a time; everyone else awaits.
    pub async fn lock_task(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// An execution handle is currently associated with this task id.
    pub async fn is_running(&self, id: &str) -> bool {
        self.running.lock().await.contains(id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Claim an execution slot. Fails with `CapacityExceeded` at the ceiling;
    /// claiming an already-claimed id is a no-op.
    pub async fn mark_started(&self, id: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.contains(id) {
            return Ok(());
        }
        if running.len() >= self.max_concurrent {
            return Err(TaskError::CapacityExceeded {
                limit: self.max_concurrent,
            });
        }
        running.insert(id.to_string());
        debug!(task_id = %id, active = running.len(), "execution slot claimed");
        Ok(())
    }

    /// Release the execution slot when the handle resolves.
    pub async fn mark_finished(&self, id: &str) {
        let mut running = self.running.lock().await;
        if running.remove(id) {
            debug!(task_id = %id, active = running.len(), "execution slot released");
        }
    }

    /// Drop lock entries that nothing holds or awaits. Called by the
    /// pressure monitor's warning pass to bound the lock map in a
    /// long-running process.
    pub async fn purge_idle_locks(&self) -> usize {
        let running = self.running.lock().await;
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|id, lock| {
            // strong_count == 1 means no owned guard and no waiter is alive.
            running.contains(id) || Arc::strong_count(lock) > 1
        });
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn ceiling_is_enforced() {
        let gate = ConcurrencyGate::new(2);
        gate.mark_started("a").await.unwrap();
        gate.mark_started("b").await.unwrap();
        let err = gate.mark_started("c").await.unwrap_err();
        assert!(matches!(err, TaskError::CapacityExceeded { limit: 2 }));

        // Releasing a slot frees capacity.
        gate.mark_finished("a").await;
        gate.mark_started("c").await.unwrap();
        assert_eq!(gate.running_count().await, 2);
    }

    #[tokio::test]
    async fn claiming_same_id_twice_is_noop() {
        let gate = ConcurrencyGate::new(1);
        gate.mark_started("a").await.unwrap();
        gate.mark_started("a").await.unwrap();
        assert_eq!(gate.running_count().await, 1);
    }

    #[tokio::test]
    async fn lock_serializes_concurrent_starters() {
        let gate = Arc::new(ConcurrencyGate::new(5));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = gate.lock_task("same-task").await;
                let n = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn locks_for_different_ids_are_independent() {
        let gate = ConcurrencyGate::new(5);
        let _a = gate.lock_task("a").await;
        // Must not deadlock.
        let _b = gate.lock_task("b").await;
    }

    #[tokio::test]
    async fn purge_reclaims_only_idle_locks() {
        let gate = ConcurrencyGate::new(5);
        {
            let _guard = gate.lock_task("held").await;
            let _unused = gate.lock_task("idle").await;
            drop(_unused);
            // "held" guard still alive — only "idle" may go.
            assert_eq!(gate.purge_idle_locks().await, 1);
        }
        // Guard dropped — now "held" is reclaimable too.
        assert_eq!(gate.purge_idle_locks().await, 1);
    }

    #[tokio::test]
    async fn running_ids_keep_their_lock_entries() {
        let gate = ConcurrencyGate::new(5);
        let guard = gate.lock_task("a").await;
        gate.mark_started("a").await.unwrap();
        drop(guard);
        assert_eq!(gate.purge_idle_locks().await, 0);
        gate.mark_finished("a").await;
        assert_eq!(gate.purge_idle_locks().await, 1);
    }
}
