// SPDX-License-Identifier: MIT
//! Task Manager — the lifecycle facade over registry, gate, validation,
//! persistence, connection accounting, and failure notification.
//!
//! Explicitly constructed and passed by reference — there is no global
//! instance. Transport handlers call into this; background services
//! (pressure monitor) are wired against the same shared components.
//!
//! Execution handles run detached: `start_task` returns as soon as the
//! pipeline has been spawned, and completion arrives later through the
//! event channel and the final result. The per-task start lock only covers
//! the admission decision; once the slot is claimed and the handle spawned,
//! the gate's running set is what keeps duplicate starts out.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::connections::{ConnectionTracker, TryRegister};
use crate::error::{Result, TaskError};
use crate::execution::{ExecutionEvent, ExecutionHandle, EVENT_CHANNEL_CAPACITY};
use crate::fingerprint::{task_id_for, RequestParams};
use crate::gate::ConcurrencyGate;
use crate::notify::{FailureMonitor, NotificationSink};
use crate::persistence::TaskStore;
use crate::pressure::PressureLevel;
use crate::registry::model::{ProgressUpdate, TaskRecord, TaskStatus};
use crate::registry::{RegistryStats, TaskRegistry};
use crate::validation::{ValidationResult, ValidationService};

/// What `start_task` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh execution was spawned.
    Started,
    /// An execution is already live for this id — attach as a consumer.
    AlreadyRunning,
    /// A valid stored result already exists — no work needed.
    AlreadyValid,
}

/// Aggregate counters for `stats()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStats {
    pub registry: RegistryStats,
    pub running_executions: usize,
    pub max_concurrent: usize,
    pub total_connections: usize,
}

/// Overall service verdict for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

pub struct TaskManager {
    registry: Arc<TaskRegistry>,
    gate: Arc<ConcurrencyGate>,
    connections: Arc<ConnectionTracker>,
    validation: ValidationService,
    store: Arc<dyn TaskStore>,
    failures: Arc<FailureMonitor>,
    occupancy_warning: f64,
}

impl TaskManager {
    pub fn new(
        config: &DaemonConfig,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(
            config.registry.clone(),
            config.pressure.clone(),
            Arc::clone(&store),
        ));
        let gate = Arc::new(ConcurrencyGate::new(config.gate.max_concurrent));
        let connections = Arc::new(ConnectionTracker::new(
            config.connections.max_per_task,
            config.connections.global_multiplier * config.registry.max_tasks,
        ));
        let validation = ValidationService::new(config.validation.clone());
        let failures = Arc::new(FailureMonitor::new(config.notify.clone(), sink));

        Self {
            registry,
            gate,
            connections,
            validation,
            store,
            failures,
            occupancy_warning: config.registry.target_occupancy,
        }
    }

    /// Shared components, for wiring background services.
    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn gate(&self) -> Arc<ConcurrencyGate> {
        Arc::clone(&self.gate)
    }

    pub fn connections(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.connections)
    }

    /// Reload durable state at boot (crash-interrupted runs become `paused`).
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        self.registry.rehydrate().await
    }

    // ── Identity & lookup ───────────────────────────────────────────────────

    /// Fingerprint the request and make sure a registry record exists.
    pub async fn get_or_create_task_id(&self, params: &RequestParams) -> Result<String> {
        let id = task_id_for(params);
        self.registry.create_if_absent(&id, params).await?;
        Ok(id)
    }

    pub async fn validation_result(
        &self,
        task_id: &str,
        force_restart: bool,
    ) -> ValidationResult {
        self.validation
            .check(&self.registry, &self.store, task_id, force_restart)
            .await
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.registry.get_task(task_id).await
    }

    pub async fn task_outputs(&self, task_id: &str) -> Option<Vec<String>> {
        self.registry.task_outputs(task_id).await
    }

    // ── Starting work ───────────────────────────────────────────────────────

    /// Start the execution pipeline for a task, enforcing the concurrency
    /// gate's double-check protocol:
    ///   1. already running → no-op;
    ///   2. global ceiling reached → `CapacityExceeded`;
    ///   3. already valid → no-op (another path produced a good result).
    ///
    /// Only then is the task marked `running` and the handle spawned,
    /// detached. Completion and failure arrive through callbacks that update
    /// the registry, persist state, and feed the failure heuristics.
    pub async fn start_task(
        &self,
        task_id: &str,
        handle: Arc<dyn ExecutionHandle>,
        params: &RequestParams,
        forward: Option<mpsc::Sender<ExecutionEvent>>,
    ) -> Result<StartOutcome> {
        // The start lock serializes the admission decision for this id and
        // is released when this function returns. Concurrent duplicates
        // queue here briefly, then observe the running set.
        let _guard = self.gate.lock_task(task_id).await;

        // (1) An execution is already associated with this id.
        if self.gate.is_running(task_id).await {
            debug!(task_id, "start skipped — execution already live");
            return Ok(StartOutcome::AlreadyRunning);
        }

        // (2) Global ceiling.
        if self.gate.running_count().await >= self.gate.max_concurrent() {
            return Err(TaskError::CapacityExceeded {
                limit: self.gate.max_concurrent(),
            });
        }

        // (3) A good result already exists.
        if self.validation_result(task_id, false).await == ValidationResult::Valid {
            debug!(task_id, "start skipped — stored result is valid");
            return Ok(StartOutcome::AlreadyValid);
        }

        // A completed-but-invalid durable record blocks the canonical id;
        // archive it (evidence preserved under a suffixed id) before the
        // fresh attempt.
        if let Ok(Some(p)) = self.store.get_task(task_id).await {
            if p.status == "completed" && !self.validation.is_result_complete(&p.outputs) {
                match self.store.archive_task(task_id).await {
                    Ok(Some(archived)) => {
                        info!(task_id, archived, "archived invalid completed result")
                    }
                    Ok(None) => {}
                    Err(e) => warn!(task_id, "archival failed, overwriting in place: {e:#}"),
                }
            }
        }

        // Bring the registry record into a startable state.
        if !self.registry.contains(task_id).await {
            self.registry.create_if_absent(task_id, params).await?;
        } else if self.registry.status_of(task_id).await != Some(TaskStatus::Initializing) {
            self.registry.reset_for_restart(task_id, params).await?;
        }

        self.gate.mark_started(task_id).await?;
        if let Err(e) = self
            .registry
            .update_progress(
                task_id,
                ProgressUpdate {
                    status: Some(TaskStatus::Running),
                    step: Some("starting research pipeline".to_string()),
                    percentage: Some(0),
                    ..Default::default()
                },
            )
            .await
        {
            // Roll the slot back — the execution never launched.
            self.gate.mark_finished(task_id).await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel::<ExecutionEvent>(EVENT_CHANNEL_CAPACITY);
        let pump = self.spawn_event_pump(task_id.to_string(), rx, forward);
        self.spawn_execution(task_id.to_string(), handle, params.clone(), tx, pump);

        info!(task_id, "research execution started");
        Ok(StartOutcome::Started)
    }

    /// Consume pipeline events: record output chunks and progress merges,
    /// then forward to the caller's subscriber if any.
    fn spawn_event_pump(
        &self,
        task_id: String,
        mut rx: mpsc::Receiver<ExecutionEvent>,
        forward: Option<mpsc::Sender<ExecutionEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let update_result = match &event {
                    ExecutionEvent::Message(chunk) => {
                        registry.append_output(&task_id, chunk.clone()).await
                    }
                    ExecutionEvent::Progress { step, percentage } => {
                        registry
                            .update_progress(
                                &task_id,
                                ProgressUpdate {
                                    step: Some(step.clone()),
                                    percentage: Some(*percentage),
                                    ..Default::default()
                                },
                            )
                            .await
                    }
                    ExecutionEvent::Error(message) => {
                        registry
                            .update_progress(
                                &task_id,
                                ProgressUpdate {
                                    message: Some(format!("pipeline error: {message}")),
                                    ..Default::default()
                                },
                            )
                            .await
                    }
                };
                if let Err(e) = update_result {
                    // Task may have been evicted mid-run; keep draining so
                    // the pipeline never blocks on a full channel.
                    debug!(task_id, "event dropped: {e}");
                }

                if let Some(fwd) = &forward {
                    let _ = fwd.send(event).await;
                }
            }
        })
    }

    /// Run the handle to completion on its own task, draining the event pump
    /// before any terminal status is recorded.
    fn spawn_execution(
        &self,
        task_id: String,
        handle: Arc<dyn ExecutionHandle>,
        params: RequestParams,
        events: mpsc::Sender<ExecutionEvent>,
        pump: tokio::task::JoinHandle<()>,
    ) {
        let registry = Arc::clone(&self.registry);
        let gate = Arc::clone(&self.gate);
        let failures = Arc::clone(&self.failures);
        // Completion re-check applies the same integrity rule the validation
        // service uses on later lookups.
        let validation = self.validation.clone();

        tokio::spawn(async move {
            let result = handle.run(&params, events).await;

            // `run` consumed the only event sender, so the channel is now
            // closed. Every buffered chunk must land in the registry before
            // the status leaves `running`, or it would be dropped.
            if let Err(e) = pump.await {
                warn!(task_id, "event pump aborted: {e}");
            }

            match result {
                Ok(value) => {
                    let update = ProgressUpdate {
                        status: Some(TaskStatus::Completed),
                        step: Some("completed".to_string()),
                        percentage: Some(100),
                        result: Some(value),
                        ..Default::default()
                    };
                    if let Err(e) = registry.update_progress(&task_id, update).await {
                        warn!(task_id, "could not record completion: {e}");
                    } else if let Some(record) = registry.peek_task(&task_id).await {
                        // Terminal re-check: completed status alone is not
                        // authoritative. An incomplete result will classify
                        // as invalid (and be archived) on the next lookup.
                        if !validation.is_result_complete(&record.outputs) {
                            warn!(
                                task_id,
                                chunks = record.outputs.len(),
                                "completed result failed integrity re-check"
                            );
                        }
                    }
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    let update = ProgressUpdate {
                        status: Some(TaskStatus::Failed),
                        step: Some("failed".to_string()),
                        error: Some(message.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = registry.update_progress(&task_id, update).await {
                        warn!(task_id, "could not record failure: {e}");
                    }
                    failures.on_task_failed(&task_id, &params, &message).await;
                }
            }

            gate.mark_finished(&task_id).await;
        });
    }

    // ── Clients ─────────────────────────────────────────────────────────────

    /// Register a subscriber for a task. At the global ceiling an orphan
    /// sweep runs once before the request is rejected.
    pub async fn register_client(&self, task_id: &str) -> Result<usize> {
        match self.connections.try_register(task_id).await {
            TryRegister::Ok(n) => Ok(n),
            TryRegister::PerTaskLimit => Err(TaskError::ConnectionLimit {
                task_id: task_id.to_string(),
            }),
            TryRegister::GlobalLimit => {
                let mut live = std::collections::HashSet::new();
                for id in self.connections.tracked_ids().await {
                    if self.registry.contains(&id).await {
                        live.insert(id);
                    }
                }
                self.connections.sweep_orphans(|id| live.contains(id)).await;
                match self.connections.try_register(task_id).await {
                    TryRegister::Ok(n) => Ok(n),
                    _ => Err(TaskError::ConnectionLimit {
                        task_id: task_id.to_string(),
                    }),
                }
            }
        }
    }

    pub async fn unregister_client(&self, task_id: &str) {
        self.connections.unregister(task_id).await;
    }

    // ── Removal ─────────────────────────────────────────────────────────────

    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        self.registry.delete_task(task_id).await
    }

    /// Archive a task: rename its durable record with a timestamp suffix
    /// (forensics survive) and free the canonical id for a fresh attempt.
    pub async fn archive_task(&self, task_id: &str, reason: &str) -> Result<Option<String>> {
        let archived = self.store.archive_task(task_id).await?;
        self.registry.forget(task_id).await;
        if let Some(archived_id) = &archived {
            info!(task_id, archived_id, reason, "task archived");
        }
        Ok(archived)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            registry: self.registry.stats().await,
            running_executions: self.gate.running_count().await,
            max_concurrent: self.gate.max_concurrent(),
            total_connections: self.connections.total().await,
        }
    }

    /// Combine registry occupancy with the supplied pressure level into a
    /// single verdict. The caller owns the pressure monitor and passes the
    /// current level in.
    pub async fn health_check(&self, pressure: PressureLevel) -> HealthStatus {
        let stats = self.registry.stats().await;
        let occupancy = if stats.max_tasks == 0 {
            0.0
        } else {
            stats.total_tasks as f64 / stats.max_tasks as f64
        };

        if pressure >= PressureLevel::Critical || occupancy >= 0.95 {
            HealthStatus::Critical
        } else if pressure >= PressureLevel::Warning || occupancy >= self.occupancy_warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}
