//! SQLite-backed [`TaskStore`] — the default durable adapter.
//!
//! WAL journal mode + NORMAL synchronous: crash-safe without paying fsync on
//! every write. The schema is a single `tasks` table with JSON payload
//! columns; archived rows stay in the table under a suffixed id with
//! `archived = 1` and are excluded from rehydration.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use tracing::warn;

use super::{archive_id, PersistedTask, TaskStore};
use crate::fingerprint::RequestParams;
use crate::registry::model::TaskProgress;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create the store with slow-query logging enabled.
    ///
    /// Queries exceeding `slow_query_ms` are logged at WARN level; 0 disables.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("researchd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                progress    TEXT NOT NULL,
                outputs     TEXT NOT NULL,
                params      TEXT NOT NULL,
                archived    INTEGER NOT NULL DEFAULT 0,
                updated_at  INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_archived ON tasks(archived)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<PersistedTask> {
        let progress_json: String = row.get("progress");
        let outputs_json: String = row.get("outputs");
        let params_json: String = row.get("params");
        let progress: TaskProgress =
            serde_json::from_str(&progress_json).context("corrupt progress column")?;
        let outputs: Vec<String> =
            serde_json::from_str(&outputs_json).context("corrupt outputs column")?;
        let params: RequestParams =
            serde_json::from_str(&params_json).context("corrupt params column")?;
        Ok(PersistedTask {
            id: row.get("id"),
            status: row.get("status"),
            progress,
            outputs,
            params,
            updated_at: row.get("updated_at"),
        })
    }

    async fn upsert(&self, task: &PersistedTask, status: &str) -> Result<()> {
        let progress = serde_json::to_string(&task.progress)?;
        let outputs = serde_json::to_string(&task.outputs)?;
        let params = serde_json::to_string(&task.params)?;
        with_timeout(async {
            sqlx::query(
                "INSERT INTO tasks (id, status, progress, outputs, params, archived, updated_at)
                 VALUES (?, ?, ?, ?, ?, 0, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     progress = excluded.progress,
                     outputs = excluded.outputs,
                     params = excluded.params,
                     updated_at = excluded.updated_at",
            )
            .bind(&task.id)
            .bind(status)
            .bind(&progress)
            .bind(&outputs)
            .bind(&params)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get_all_tasks(&self) -> Result<Vec<PersistedTask>> {
        let rows = with_timeout(async {
            Ok(sqlx::query("SELECT * FROM tasks WHERE archived = 0")
                .fetch_all(&self.pool)
                .await?)
        })
        .await?;

        // Tolerate individual corrupt rows instead of failing the whole boot.
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_task(row) {
                Ok(t) => tasks.push(t),
                Err(e) => warn!("skipping unreadable task row: {e:#}"),
            }
        }
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<PersistedTask>> {
        let row = with_timeout(async {
            Ok(sqlx::query("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn save_task(&self, task: &PersistedTask) -> Result<()> {
        self.upsert(task, task.progress.status.as_str()).await
    }

    async fn save_task_with_status(&self, task: &PersistedTask, status: &str) -> Result<()> {
        self.upsert(task, status).await
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn archive_task(&self, id: &str) -> Result<Option<String>> {
        let new_id = archive_id(id, Utc::now());
        let affected = with_timeout(async {
            Ok(sqlx::query("UPDATE tasks SET id = ?, archived = 1 WHERE id = ? AND archived = 0")
                .bind(&new_id)
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected())
        })
        .await?;
        Ok((affected > 0).then_some(new_id))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
