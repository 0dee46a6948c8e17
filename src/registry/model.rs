//! Task registry data model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::RequestParams;

/// Lifecycle state of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet handed to an execution handle.
    Initializing,
    /// An execution handle is live for this task.
    Running,
    /// Rehydrated from a durable `running` record after a restart. The
    /// original execution cannot have survived the process, so the task must
    /// be restarted by a fresh request — it is never auto-resumed.
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal for this execution attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Initializing => "initializing",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "initializing" => Some(TaskStatus::Initializing),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Valid status transitions.
///
/// `paused` is only ever *entered* by boot rehydration, never by a runtime
/// mutation. A terminal-but-invalid result re-enters `initializing` when a
/// fresh request restarts the task.
pub fn valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Initializing, Running)
            | (Initializing, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Paused, Initializing) // restart after a crash-interrupted run
            | (Paused, Running)
            | (Completed, Initializing) // restart after an invalid result
            | (Failed, Initializing)
    )
}

/// Progress snapshot reported by the execution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Human-readable description of the current pipeline stage.
    pub step: String,
    /// 0..=100.
    pub percentage: u8,
    pub status: TaskStatus,
    /// Ordered pipeline messages (distinct from streamed output chunks).
    pub messages: Vec<String>,
    /// Final result payload, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Refreshed on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self {
            step: "created".to_string(),
            percentage: 0,
            status: TaskStatus::Initializing,
            messages: Vec::new(),
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial progress mutation. Unset fields leave the record untouched;
/// `message` appends. Last-writer-wins within the process.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub step: Option<String>,
    pub percentage: Option<u8>,
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Read-pattern bookkeeping, consumed only by the eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessStats {
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    /// 0..=100, recomputed on every read.
    pub value_score: u8,
}

impl AccessStats {
    pub fn new() -> Self {
        Self {
            last_access: Utc::now(),
            access_count: 0,
            value_score: 0,
        }
    }
}

impl Default for AccessStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A tracked research task. Keyed by its fingerprint (or passthrough) id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Immutable snapshot of the normalized inputs that produced this id.
    pub params: RequestParams,
    pub progress: TaskProgress,
    /// Append-only streamed text chunks; frozen at terminal status except
    /// for eviction-driven truncation.
    pub outputs: Vec<String>,
    pub access: AccessStats,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: String, params: RequestParams) -> Self {
        Self {
            id,
            params,
            progress: TaskProgress::new(),
            outputs: Vec::new(),
            access: AccessStats::new(),
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.progress.status
    }

    /// Age of the task since creation, in whole seconds (never negative).
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_seconds().max(0) as u64
    }

    /// Seconds since the last read (never negative).
    pub fn idle_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.access.last_access).num_seconds().max(0) as u64
    }
}
