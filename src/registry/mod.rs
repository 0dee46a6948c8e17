// SPDX-License-Identifier: MIT
//! Task Registry — authoritative in-memory map of task state, outputs, and
//! request parameters.
//!
//! The registry is the single source of truth while the process is alive.
//! Every mutation refreshes the record timestamp and schedules a
//! fire-and-forget durable write; a failed write degrades to "durability
//! lost for this write" and is logged, never propagated. At boot,
//! [`TaskRegistry::rehydrate`] reloads durable records — tasks last recorded
//! as `running` come back as `paused`, because the execution they were
//! attached to cannot have survived the restart.

pub mod model;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{PressureConfig, RegistryConfig};
use crate::error::{Result, TaskError};
use crate::fingerprint::RequestParams;
use crate::persistence::{PersistedTask, TaskStore};
use model::{valid_transition, ProgressUpdate, TaskRecord, TaskStatus};

// ─── Value scoring ───────────────────────────────────────────────────────────

/// Bounded access-frequency credit: 4 points per read, capped at 40.
const VALUE_ACCESS_UNIT: u64 = 4;
const VALUE_ACCESS_CAP: u64 = 40;
/// Recency credit decays linearly from 30 to 0 over this horizon.
const VALUE_RECENCY_CAP: f64 = 30.0;
const VALUE_RECENCY_HORIZON_SECS: f64 = 24.0 * 3600.0;
/// Flat bonus for a completed task with non-empty outputs.
const VALUE_COMPLETED_BONUS: u64 = 20;
/// Smaller bonus for simply having reached a terminal state.
const VALUE_TERMINAL_BONUS: u64 = 10;

/// Estimate how worth-retaining a task is, 0..=100.
pub fn compute_value_score(record: &TaskRecord, now: DateTime<Utc>) -> u8 {
    let access = (record.access.access_count * VALUE_ACCESS_UNIT).min(VALUE_ACCESS_CAP);

    let idle = record.idle_secs(now) as f64;
    let recency =
        (VALUE_RECENCY_CAP * (1.0 - idle / VALUE_RECENCY_HORIZON_SECS)).clamp(0.0, VALUE_RECENCY_CAP);

    let status = record.status();
    let completed_bonus = if status == TaskStatus::Completed && !record.outputs.is_empty() {
        VALUE_COMPLETED_BONUS
    } else {
        0
    };
    let terminal_bonus = if status.is_terminal() {
        VALUE_TERMINAL_BONUS
    } else {
        0
    };

    (access + recency as u64 + completed_bonus + terminal_bonus).min(100) as u8
}

/// Removal priority for a non-running cleanup candidate. Higher = removed
/// earlier. Running tasks are never candidates.
pub fn cleanup_priority(record: &TaskRecord, cfg: &PressureConfig, now: DateTime<Utc>) -> f64 {
    let age = record.age_secs(now);
    let idle = record.idle_secs(now);

    // Hard ceilings trump the weighted score entirely.
    if age > cfg.hard_age_secs && idle > cfg.hard_idle_secs {
        return f64::MAX;
    }

    let age_factor = (1.0 + age as f64).ln();
    let idle_factor = (1.0 + idle as f64).ln() / (1.0 + (1.0 + record.access.access_count as f64).ln());
    let value_factor = (100 - record.access.value_score as i64) as f64 / 100.0;
    let status_factor = match record.status() {
        TaskStatus::Failed => 1.0,
        TaskStatus::Paused => 0.75,
        TaskStatus::Completed => 0.5,
        TaskStatus::Initializing => 0.25,
        // Filtered out before scoring; scored as unremovable if it slips in.
        TaskStatus::Running => return f64::MIN,
    };

    cfg.weight_age * age_factor
        + cfg.weight_idle * idle_factor
        + cfg.weight_value * value_factor
        + cfg.weight_status * status_factor
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Aggregate registry counters for `stats()` / health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total_tasks: usize,
    pub initializing: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_output_chunks: usize,
    pub max_tasks: usize,
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    config: RegistryConfig,
    pressure: PressureConfig,
    store: Arc<dyn TaskStore>,
}

impl TaskRegistry {
    pub fn new(
        config: RegistryConfig,
        pressure: PressureConfig,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            config,
            pressure,
            store,
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    /// Reload durable records at boot. A task last persisted as `running`
    /// becomes `paused`: the execution did not survive the restart, and the
    /// task must be restarted by a fresh request, never auto-resumed. The
    /// paused status is written back so the durable record agrees.
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let persisted = self.store.get_all_tasks().await?;
        let mut tasks = self.tasks.write().await;
        let mut paused = 0usize;

        for p in persisted {
            let mut record = TaskRecord::new(p.id.clone(), p.params);
            record.progress = p.progress;
            record.outputs = p.outputs;

            if record.status() == TaskStatus::Running {
                record.progress.status = TaskStatus::Paused;
                record.progress.updated_at = Utc::now();
                paused += 1;
                self.persist_detached(&record);
            }

            tasks.insert(p.id, record);
        }

        info!(
            restored = tasks.len(),
            paused, "task registry rehydrated from durable store"
        );
        Ok(tasks.len())
    }

    /// Create the record for `id` if it does not exist. Returns `true` when a
    /// new record was created. When the registry is full an eviction pass
    /// runs first; if it stays full the insert fails with `MaxTasksReached`.
    pub async fn create_if_absent(&self, id: &str, params: &RequestParams) -> Result<bool> {
        {
            let tasks = self.tasks.read().await;
            if tasks.contains_key(id) {
                return Ok(false);
            }
            if tasks.len() < self.config.max_tasks {
                drop(tasks);
                return self.insert_new(id, params).await;
            }
        }

        let evicted = self.evict_to_target().await;
        debug!(evicted, "registry full — ran eviction before insert");

        let tasks = self.tasks.read().await;
        if tasks.len() >= self.config.max_tasks {
            return Err(TaskError::MaxTasksReached {
                limit: self.config.max_tasks,
            });
        }
        drop(tasks);
        self.insert_new(id, params).await
    }

    async fn insert_new(&self, id: &str, params: &RequestParams) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(id) {
            return Ok(false);
        }
        // Recheck under the write lock: a concurrent create may have filled
        // the slot the read-lock check saw as free.
        if tasks.len() >= self.config.max_tasks {
            return Err(TaskError::MaxTasksReached {
                limit: self.config.max_tasks,
            });
        }
        let record = TaskRecord::new(id.to_string(), params.clone());
        self.persist_detached(&record);
        tasks.insert(id.to_string(), record);
        Ok(true)
    }

    /// Read a task, refreshing its access stats and value score.
    pub async fn get_task(&self, id: &str) -> Option<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(id)?;
        Self::touch(record);
        Some(record.clone())
    }

    /// Read a task without counting the read (internal bookkeeping paths).
    pub async fn peek_task(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn task_outputs(&self, id: &str) -> Option<Vec<String>> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(id)?;
        Self::touch(record);
        Some(record.outputs.clone())
    }

    pub async fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.read().await.get(id).map(|r| r.status())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn touch(record: &mut TaskRecord) {
        let now = Utc::now();
        record.access.access_count += 1;
        record.access.last_access = now;
        record.access.value_score = compute_value_score(record, now);
    }

    /// Merge a partial update into the record. Status changes are checked
    /// against the state machine; everything else is last-writer-wins.
    pub async fn update_progress(&self, id: &str, update: ProgressUpdate) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if let Some(next) = update.status {
            let current = record.status();
            if next != current && !valid_transition(current, next) {
                return Err(TaskError::InvalidTransition {
                    task_id: id.to_string(),
                    from: current.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            record.progress.status = next;
        }
        if let Some(step) = update.step {
            record.progress.step = step;
        }
        if let Some(pct) = update.percentage {
            record.progress.percentage = pct.min(100);
        }
        if let Some(msg) = update.message {
            record.progress.messages.push(msg);
        }
        if let Some(result) = update.result {
            record.progress.result = Some(result);
        }
        if let Some(error) = update.error {
            record.progress.error = Some(error);
        }
        record.progress.updated_at = Utc::now();

        self.persist_detached(record);
        Ok(())
    }

    /// Append a streamed output chunk. Outputs only grow while the task is
    /// running; appends against any other status are dropped with a warning.
    pub async fn append_output(&self, id: &str, chunk: String) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if record.status() != TaskStatus::Running {
            warn!(
                task_id = %id,
                status = %record.status(),
                "dropping output chunk for non-running task"
            );
            return Ok(());
        }

        record.outputs.push(chunk);
        record.progress.updated_at = Utc::now();
        self.persist_detached(record);
        Ok(())
    }

    /// Reset a terminal-or-paused task for a fresh execution attempt:
    /// progress returns to `initializing`, outputs are cleared, access stats
    /// survive.
    pub async fn reset_for_restart(&self, id: &str, params: &RequestParams) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        let current = record.status();
        if !valid_transition(current, TaskStatus::Initializing) {
            return Err(TaskError::InvalidTransition {
                task_id: id.to_string(),
                from: current.as_str().to_string(),
                to: TaskStatus::Initializing.as_str().to_string(),
            });
        }

        record.params = params.clone();
        record.progress = model::TaskProgress::new();
        record.outputs.clear();
        record.created_at = Utc::now();
        self.persist_detached(record);
        Ok(())
    }

    /// Remove a task from memory and (fire-and-forget) from the durable
    /// store. Running tasks are never removed.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(id) {
            None => return Ok(false),
            Some(r) if r.status() == TaskStatus::Running => {
                warn!(task_id = %id, "refusing to delete a running task");
                return Ok(false);
            }
            Some(_) => {}
        }
        tasks.remove(id);
        drop(tasks);

        let store = Arc::clone(&self.store);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.delete_task(&id).await {
                warn!(task_id = %id, "durable delete failed: {e:#}");
            }
        });
        Ok(true)
    }

    /// Drop the in-memory entry without touching the durable store (the
    /// archival path renames the durable record itself).
    pub async fn forget(&self, id: &str) -> bool {
        self.tasks.write().await.remove(id).is_some()
    }

    // ── Eviction support ────────────────────────────────────────────────────

    /// Truncate over-long output buffers of non-running tasks, keeping the
    /// most recent `output_keep_ratio` of chunks. Returns tasks truncated.
    pub async fn trim_oversized_outputs(&self) -> usize {
        let cap = self.config.output_chunk_cap;
        let keep_ratio = self.config.output_keep_ratio;
        let mut trimmed = 0usize;

        let mut tasks = self.tasks.write().await;
        for record in tasks.values_mut() {
            if record.status() == TaskStatus::Running {
                continue;
            }
            if record.outputs.len() > cap {
                let keep = ((record.outputs.len() as f64) * keep_ratio) as usize;
                let drop_n = record.outputs.len() - keep.max(1);
                record.outputs.drain(..drop_n);
                record.progress.updated_at = Utc::now();
                trimmed += 1;
            }
        }
        trimmed
    }

    /// Remove completed tasks at least `max_age_secs` old. Returns removals.
    pub async fn remove_completed_older_than(&self, max_age_secs: u64) -> usize {
        let now = Utc::now();
        let victims: Vec<String> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|r| r.status() == TaskStatus::Completed && r.age_secs(now) >= max_age_secs)
                .map(|r| r.id.clone())
                .collect()
        };
        self.remove_many(&victims).await
    }

    /// Emergency sweep: delete up to `ratio` of completed tasks older than
    /// `age_floor_secs`, worst cleanup-priority first.
    pub async fn emergency_sweep(&self, age_floor_secs: u64, ratio: f64) -> usize {
        let now = Utc::now();
        let mut eligible: Vec<(f64, String)> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|r| {
                    r.status() == TaskStatus::Completed && r.age_secs(now) >= age_floor_secs
                })
                .map(|r| (cleanup_priority(r, &self.pressure, now), r.id.clone()))
                .collect()
        };
        if eligible.is_empty() {
            return 0;
        }

        eligible.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let budget = ((eligible.len() as f64) * ratio).floor() as usize;
        let victims: Vec<String> = eligible.into_iter().take(budget).map(|(_, id)| id).collect();
        self.remove_many(&victims).await
    }

    /// Value-scored sweep down to the target occupancy
    /// (`max_tasks * target_occupancy`). Running tasks are never eligible.
    pub async fn evict_to_target(&self) -> usize {
        let target = ((self.config.max_tasks as f64) * self.config.target_occupancy) as usize;
        let now = Utc::now();

        let mut candidates: Vec<(f64, String)> = {
            let tasks = self.tasks.read().await;
            if tasks.len() <= target {
                return 0;
            }
            tasks
                .values()
                .filter(|r| r.status() != TaskStatus::Running)
                .map(|r| (cleanup_priority(r, &self.pressure, now), r.id.clone()))
                .collect()
        };

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let over = self.len().await.saturating_sub(target);
        let victims: Vec<String> = candidates.into_iter().take(over).map(|(_, id)| id).collect();
        self.remove_many(&victims).await
    }

    async fn remove_many(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut removed = 0usize;
        {
            let mut tasks = self.tasks.write().await;
            for id in ids {
                // Re-check under the write lock: a task may have started
                // running since the candidate snapshot was taken.
                let still_safe = tasks
                    .get(id)
                    .map(|r| r.status() != TaskStatus::Running)
                    .unwrap_or(false);
                if still_safe {
                    tasks.remove(id);
                    removed += 1;
                }
            }
            if removed > 0 {
                tasks.shrink_to_fit();
            }
        }

        let store = Arc::clone(&self.store);
        let ids: Vec<String> = ids.to_vec();
        tokio::spawn(async move {
            for id in ids {
                if let Err(e) = store.delete_task(&id).await {
                    warn!(task_id = %id, "durable delete during eviction failed: {e:#}");
                }
            }
        });

        removed
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Schedule a fire-and-forget durable write for the record's current
    /// state. Must never block the calling request path.
    fn persist_detached(&self, record: &TaskRecord) {
        let store = Arc::clone(&self.store);
        let snapshot = PersistedTask::new(
            record.id.clone(),
            record.progress.clone(),
            record.outputs.clone(),
            record.params.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = store.save_task(&snapshot).await {
                warn!(task_id = %snapshot.id, "durable write failed (registry stays authoritative): {e:#}");
            }
        });
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.read().await;
        let mut stats = RegistryStats {
            total_tasks: tasks.len(),
            initializing: 0,
            running: 0,
            paused: 0,
            completed: 0,
            failed: 0,
            total_output_chunks: 0,
            max_tasks: self.config.max_tasks,
        };
        for r in tasks.values() {
            stats.total_output_chunks += r.outputs.len();
            match r.status() {
                TaskStatus::Initializing => stats.initializing += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
