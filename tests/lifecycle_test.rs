//! End-to-end lifecycle tests over the real SQLite store.
//! No external research pipeline needed — executions are stubbed, so these
//! run in CI.

use async_trait::async_trait;
use researchd::config::DaemonConfig;
use researchd::execution::{ExecutionEvent, ExecutionHandle};
use researchd::fingerprint::RequestParams;
use researchd::manager::{StartOutcome, TaskManager};
use researchd::notify::NullSink;
use researchd::persistence::{SqliteTaskStore, TaskStore};
use researchd::registry::model::TaskStatus;
use researchd::{TaskError, ValidationResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Stub pipeline: counts starts, streams a well-formed report, then resolves.
struct StubPipeline {
    starts: AtomicUsize,
    delay: Duration,
    report_body: String,
}

impl StubPipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
            report_body: "x".repeat(800),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            delay,
            report_body: "x".repeat(800),
        })
    }
}

#[async_trait]
impl ExecutionHandle for StubPipeline {
    async fn run(
        &self,
        _params: &RequestParams,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> anyhow::Result<serde_json::Value> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = events
            .send(ExecutionEvent::Progress {
                step: "searching".to_string(),
                percentage: 30,
            })
            .await;
        let _ = events
            .send(ExecutionEvent::Message(format!(
                "<report>{}</report>",
                self.report_body
            )))
            .await;
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({ "sections": 3 }))
    }
}

async fn make_manager(dir: &TempDir) -> (TaskManager, Arc<dyn TaskStore>) {
    let config = DaemonConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::new(dir.path())
            .await
            .expect("store init failed"),
    );
    let manager = TaskManager::new(&config, Arc::clone(&store), Arc::new(NullSink));
    (manager, store)
}

fn params(query: &str) -> RequestParams {
    RequestParams {
        query: query.to_string(),
        ..Default::default()
    }
}

async fn wait_for_terminal(manager: &TaskManager, id: &str) {
    for _ in 0..300 {
        if let Some(task) = manager.get_task(id).await {
            if task.status().is_terminal() {
                // Let the detached durable write land too.
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never reached a terminal state");
}

#[tokio::test]
async fn identical_requests_map_to_one_task_and_one_execution() {
    let dir = TempDir::new().unwrap();
    let (manager, _store) = make_manager(&dir).await;

    // Normalization: case and whitespace differences collapse to one id.
    let a = params("Rust async runtimes");
    let b = params("  rust ASYNC runtimes  ");
    let id_a = manager.get_or_create_task_id(&a).await.unwrap();
    let id_b = manager.get_or_create_task_id(&b).await.unwrap();
    assert_eq!(id_a, id_b);
    assert_eq!(id_a.len(), 32);

    let pipeline = StubPipeline::new();
    let first = manager
        .start_task(&id_a, Arc::clone(&pipeline) as Arc<dyn ExecutionHandle>, &a, None)
        .await
        .unwrap();
    let second = manager
        .start_task(&id_a, Arc::clone(&pipeline) as Arc<dyn ExecutionHandle>, &b, None)
        .await
        .unwrap();

    assert_eq!(first, StartOutcome::Started);
    assert_eq!(second, StartOutcome::AlreadyRunning);
    wait_for_terminal(&manager, &id_a).await;
    assert_eq!(pipeline.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completed_result_is_reused_not_recomputed() {
    let dir = TempDir::new().unwrap();
    let (manager, _store) = make_manager(&dir).await;
    let p = params("cache hit");
    let id = manager.get_or_create_task_id(&p).await.unwrap();

    manager
        .start_task(&id, StubPipeline::new(), &p, None)
        .await
        .unwrap();
    wait_for_terminal(&manager, &id).await;
    // Let the fire-and-forget durable write land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        manager.validation_result(&id, false).await,
        ValidationResult::Valid
    );

    let pipeline = StubPipeline::new();
    let out = manager
        .start_task(&id, Arc::clone(&pipeline) as Arc<dyn ExecutionHandle>, &p, None)
        .await
        .unwrap();
    assert_eq!(out, StartOutcome::AlreadyValid);
    assert_eq!(pipeline.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sixth_start_is_rejected_others_unaffected() {
    let dir = TempDir::new().unwrap();
    let (manager, _store) = make_manager(&dir).await;
    let slow = StubPipeline::slow(Duration::from_millis(800));

    for i in 0..5 {
        let p = params(&format!("concurrent {i}"));
        let id = manager.get_or_create_task_id(&p).await.unwrap();
        let out = manager
            .start_task(&id, Arc::clone(&slow) as Arc<dyn ExecutionHandle>, &p, None)
            .await
            .unwrap();
        assert_eq!(out, StartOutcome::Started);
    }

    let p6 = params("concurrent 5");
    let id6 = manager.get_or_create_task_id(&p6).await.unwrap();
    let err = manager
        .start_task(&id6, Arc::clone(&slow) as Arc<dyn ExecutionHandle>, &p6, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::CapacityExceeded { limit: 5 }));

    let stats = manager.stats().await;
    assert_eq!(stats.running_executions, 5);
    // The rejected task stays queued-less but registered, restartable later.
    assert_eq!(
        manager.get_task(&id6).await.unwrap().status(),
        TaskStatus::Initializing
    );
}

#[tokio::test]
async fn restart_pauses_interrupted_runs_and_allows_rerun() {
    let dir = TempDir::new().unwrap();
    let id;
    let p = params("interrupted by crash");
    {
        let (manager, store) = make_manager(&dir).await;
        id = manager.get_or_create_task_id(&p).await.unwrap();
        manager
            .start_task(&id, StubPipeline::slow(Duration::from_secs(30)), &p, None)
            .await
            .unwrap();
        // Give the running-status write time to land durably, then "crash"
        // by dropping the manager without waiting for the execution.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let persisted = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(persisted.status, "running");
        store.close().await;
    }

    // New process: rehydration must demote the stale running record.
    let (manager, store) = make_manager(&dir).await;
    let rehydrated = manager.rehydrate().await.unwrap();
    assert_eq!(rehydrated, 1);
    assert_eq!(
        manager.get_task(&id).await.unwrap().status(),
        TaskStatus::Paused
    );
    // Paused is written back, so validation reports a miss, not "running".
    tokio::time::sleep(Duration::from_millis(50)).await;
    let persisted = store.get_task(&id).await.unwrap().unwrap();
    assert_eq!(persisted.status, "paused");
    assert_eq!(
        manager.validation_result(&id, false).await,
        ValidationResult::Invalid
    );

    // A fresh request restarts it; it is never auto-resumed.
    let pipeline = StubPipeline::new();
    let out = manager
        .start_task(&id, Arc::clone(&pipeline) as Arc<dyn ExecutionHandle>, &p, None)
        .await
        .unwrap();
    assert_eq!(out, StartOutcome::Started);
    wait_for_terminal(&manager, &id).await;
    assert_eq!(pipeline.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn archived_record_survives_under_suffixed_id() {
    let dir = TempDir::new().unwrap();
    let (manager, store) = make_manager(&dir).await;
    let p = params("to be archived");
    let id = manager.get_or_create_task_id(&p).await.unwrap();
    manager
        .start_task(&id, StubPipeline::new(), &p, None)
        .await
        .unwrap();
    wait_for_terminal(&manager, &id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let archived_id = manager
        .archive_task(&id, "superseded")
        .await
        .unwrap()
        .expect("nothing archived");
    assert!(archived_id.starts_with(&format!("{id}_archived_")));

    // Canonical id is free; the evidence is reachable by the archive id.
    assert!(store.get_task(&id).await.unwrap().is_none());
    let archived = store.get_task(&archived_id).await.unwrap().unwrap();
    assert_eq!(archived.status, "completed");
    assert!(!archived.outputs.is_empty());
    // And not part of rehydration.
    let all = store.get_all_tasks().await.unwrap();
    assert!(all.iter().all(|t| t.id != archived_id));
}

#[tokio::test]
async fn message_id_passthrough_skips_fingerprinting() {
    let dir = TempDir::new().unwrap();
    let (manager, _store) = make_manager(&dir).await;

    let p = RequestParams {
        query: "whatever".to_string(),
        message_id: Some("msg-42".to_string()),
        ..Default::default()
    };
    let id = manager.get_or_create_task_id(&p).await.unwrap();
    assert_eq!(id, "msg-42");
}

#[tokio::test]
async fn delete_refuses_running_tasks() {
    let dir = TempDir::new().unwrap();
    let (manager, _store) = make_manager(&dir).await;
    let p = params("do not delete me");
    let id = manager.get_or_create_task_id(&p).await.unwrap();
    manager
        .start_task(&id, StubPipeline::slow(Duration::from_millis(300)), &p, None)
        .await
        .unwrap();

    // Refused while running, but not an error.
    assert!(!manager.delete_task(&id).await.unwrap());
    assert!(manager.get_task(&id).await.is_some());

    wait_for_terminal(&manager, &id).await;
    assert!(manager.delete_task(&id).await.unwrap());
    assert!(manager.get_task(&id).await.is_none());
}
