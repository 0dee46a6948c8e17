//! In-memory [`TaskStore`] — no durability across restarts.
//!
//! Used by tests and by deployments that explicitly opt out of SQLite.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{archive_id, PersistedTask, TaskStore};

#[derive(Default)]
pub struct MemoryTaskStore {
    active: Mutex<HashMap<String, PersistedTask>>,
    archived: Mutex<HashMap<String, PersistedTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived records remain queryable by their suffixed id.
    pub async fn get_archived(&self, archive_id: &str) -> Option<PersistedTask> {
        self.archived.lock().await.get(archive_id).cloned()
    }

    pub async fn archived_count(&self) -> usize {
        self.archived.lock().await.len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_all_tasks(&self) -> anyhow::Result<Vec<PersistedTask>> {
        Ok(self.active.lock().await.values().cloned().collect())
    }

    async fn get_task(&self, id: &str) -> anyhow::Result<Option<PersistedTask>> {
        if let Some(t) = self.active.lock().await.get(id).cloned() {
            return Ok(Some(t));
        }
        Ok(self.archived.lock().await.get(id).cloned())
    }

    async fn save_task(&self, task: &PersistedTask) -> anyhow::Result<()> {
        let mut t = task.clone();
        t.status = t.progress.status.as_str().to_string();
        t.updated_at = Utc::now().timestamp();
        self.active.lock().await.insert(t.id.clone(), t);
        Ok(())
    }

    async fn save_task_with_status(
        &self,
        task: &PersistedTask,
        status: &str,
    ) -> anyhow::Result<()> {
        let mut t = task.clone();
        t.status = status.to_string();
        t.updated_at = Utc::now().timestamp();
        self.active.lock().await.insert(t.id.clone(), t);
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        self.active.lock().await.remove(id);
        Ok(())
    }

    async fn archive_task(&self, id: &str) -> anyhow::Result<Option<String>> {
        let mut active = self.active.lock().await;
        let Some(mut task) = active.remove(id) else {
            return Ok(None);
        };
        let new_id = archive_id(id, Utc::now());
        task.id = new_id.clone();
        self.archived.lock().await.insert(new_id.clone(), task);
        Ok(Some(new_id))
    }

    async fn close(&self) {}
}
