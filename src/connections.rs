//! Connection accounting — per-task subscriber counters.
//!
//! Pure bookkeeping: the core never fans out messages itself, it only tracks
//! how many consumers (e.g. SSE listeners) are attached to each task so the
//! eviction policy and the global ceiling have something to consult.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRegister {
    /// Registered; carries the new subscriber count for the task.
    Ok(usize),
    /// This task is at its per-task ceiling.
    PerTaskLimit,
    /// The sum across all tasks is at the global ceiling. The caller should
    /// run an orphan sweep and retry once before rejecting.
    GlobalLimit,
}

pub struct ConnectionTracker {
    counts: Mutex<HashMap<String, usize>>,
    max_per_task: usize,
    global_max: usize,
}

impl ConnectionTracker {
    pub fn new(max_per_task: usize, global_max: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_per_task,
            global_max,
        }
    }

    pub async fn try_register(&self, task_id: &str) -> TryRegister {
        let mut counts = self.counts.lock().await;
        let current = counts.get(task_id).copied().unwrap_or(0);
        if current >= self.max_per_task {
            return TryRegister::PerTaskLimit;
        }
        let total: usize = counts.values().sum();
        if total >= self.global_max {
            return TryRegister::GlobalLimit;
        }
        let n = current + 1;
        counts.insert(task_id.to_string(), n);
        TryRegister::Ok(n)
    }

    /// Decrement; the counter disappears entirely at zero.
    pub async fn unregister(&self, task_id: &str) {
        let mut counts = self.counts.lock().await;
        if let Some(n) = counts.get_mut(task_id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(task_id);
            }
        }
    }

    pub async fn count_for(&self, task_id: &str) -> usize {
        self.counts.lock().await.get(task_id).copied().unwrap_or(0)
    }

    pub async fn total(&self) -> usize {
        self.counts.lock().await.values().sum()
    }

    /// Task ids with at least one tracked subscriber.
    pub async fn tracked_ids(&self) -> Vec<String> {
        self.counts.lock().await.keys().cloned().collect()
    }

    /// Drop counters whose task no longer exists (or that somehow reached
    /// zero without being removed). Returns entries reclaimed.
    pub async fn sweep_orphans(&self, is_live: impl Fn(&str) -> bool) -> usize {
        let mut counts = self.counts.lock().await;
        let before = counts.len();
        counts.retain(|id, n| *n > 0 && is_live(id));
        let reclaimed = before - counts.len();
        if reclaimed > 0 {
            debug!(reclaimed, "orphan connection counters reclaimed");
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_task_ceiling() {
        let tracker = ConnectionTracker::new(3, 100);
        assert_eq!(tracker.try_register("t1").await, TryRegister::Ok(1));
        assert_eq!(tracker.try_register("t1").await, TryRegister::Ok(2));
        // Registering the ceiling-th client succeeds…
        assert_eq!(tracker.try_register("t1").await, TryRegister::Ok(3));
        // …the one past it fails.
        assert_eq!(tracker.try_register("t1").await, TryRegister::PerTaskLimit);
    }

    #[tokio::test]
    async fn unregister_frees_a_slot_and_drops_at_zero() {
        let tracker = ConnectionTracker::new(2, 100);
        tracker.try_register("t1").await;
        tracker.try_register("t1").await;
        tracker.unregister("t1").await;
        assert_eq!(tracker.count_for("t1").await, 1);
        assert_eq!(tracker.try_register("t1").await, TryRegister::Ok(2));

        tracker.unregister("t1").await;
        tracker.unregister("t1").await;
        assert_eq!(tracker.count_for("t1").await, 0);
        assert_eq!(tracker.total().await, 0);
    }

    #[tokio::test]
    async fn global_ceiling_signals_sweep() {
        let tracker = ConnectionTracker::new(10, 2);
        tracker.try_register("a").await;
        tracker.try_register("b").await;
        assert_eq!(tracker.try_register("c").await, TryRegister::GlobalLimit);

        // Sweep with "a" gone frees room.
        assert_eq!(tracker.sweep_orphans(|id| id != "a").await, 1);
        assert_eq!(tracker.try_register("c").await, TryRegister::Ok(1));
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let tracker = ConnectionTracker::new(2, 10);
        tracker.unregister("ghost").await;
        assert_eq!(tracker.total().await, 0);
    }
}
