//! Durable store contract for task records.
//!
//! The registry is authoritative while the process is alive; the store is
//! consulted at boot (rehydration) and written on every mutation. Writes on
//! the request path are fire-and-forget — a failed write degrades to
//! "durability lost for this write", logged, never retried inline.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fingerprint::RequestParams;
use crate::registry::model::TaskProgress;

/// Durable snapshot of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: String,
    /// Durable status string. Usually mirrors `progress.status`, but
    /// [`TaskStore::save_task_with_status`] can override it.
    pub status: String,
    pub progress: TaskProgress,
    pub outputs: Vec<String>,
    pub params: RequestParams,
    /// Unix seconds of the last durable write.
    pub updated_at: i64,
}

impl PersistedTask {
    pub fn new(
        id: impl Into<String>,
        progress: TaskProgress,
        outputs: Vec<String>,
        params: RequestParams,
    ) -> Self {
        let status = progress.status.as_str().to_string();
        Self {
            id: id.into(),
            status,
            progress,
            outputs,
            params,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Contract the lifecycle core expects from a durable store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All non-archived tasks, for boot rehydration.
    async fn get_all_tasks(&self) -> anyhow::Result<Vec<PersistedTask>>;

    /// Look up a task by id. Archived records are only reachable through
    /// their suffixed archive id.
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<PersistedTask>>;

    /// Upsert the task, deriving the durable status from `progress.status`.
    async fn save_task(&self, task: &PersistedTask) -> anyhow::Result<()>;

    /// Upsert with an explicit durable status string overriding
    /// `progress.status`.
    async fn save_task_with_status(
        &self,
        task: &PersistedTask,
        status: &str,
    ) -> anyhow::Result<()>;

    async fn delete_task(&self, id: &str) -> anyhow::Result<()>;

    /// Rename the record to a timestamp-suffixed id outside the active
    /// namespace, preserving it for forensics. Returns the archive id, or
    /// `None` if there was nothing to archive.
    async fn archive_task(&self, id: &str) -> anyhow::Result<Option<String>>;

    /// Flush and release underlying resources.
    async fn close(&self);
}

/// Archive ids are `{canonical}_archived_{unix_ts}`.
pub fn archive_id(id: &str, at: chrono::DateTime<chrono::Utc>) -> String {
    format!("{id}_archived_{}", at.timestamp())
}
