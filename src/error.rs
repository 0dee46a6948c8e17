//! Error taxonomy for the task lifecycle core.
//!
//! Only a handful of conditions are caller-visible: capacity limits, the
//! registry ceiling, connection ceilings, and missing tasks. Persistence
//! problems are deliberately *not* part of this enum — the registry stays
//! authoritative in memory and a failed durable write is logged and dropped.

use thiserror::Error;

/// Errors surfaced by the task registry, gate, and manager.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The global concurrent-execution ceiling was hit. Not retried
    /// internally — callers should surface this as "try again later".
    #[error("concurrent execution limit reached ({limit} running)")]
    CapacityExceeded { limit: usize },

    /// The registry is full even after an eviction pass.
    #[error("task registry is full ({limit} tasks)")]
    MaxTasksReached { limit: usize },

    /// Per-task or global subscriber ceiling reached.
    #[error("connection limit reached for task {task_id}")]
    ConnectionLimit { task_id: String },

    /// No task with this id exists in the active namespace.
    #[error("task {0} not found")]
    NotFound(String),

    /// A status mutation that the state machine forbids.
    #[error("invalid status transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// A durable-store operation failed on a path where the caller must know
    /// (deletion, archival). Fire-and-forget writes never produce this.
    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
