//! Critical-failure notification — best-effort escalation side channel.
//!
//! Every terminal failure is counted in a trailing window; when the window
//! count meets the threshold, or the failure message matches a known-fatal
//! pattern, a structured alert goes to the notification sink. Alert context
//! is redacted (query truncated, no raw payloads) and delivery is spawned
//! fire-and-forget — a sink failure is logged and must never reach task
//! handling.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::fingerprint::RequestParams;

/// Failure messages that warrant an immediate alert regardless of frequency:
/// total provider outage, exhausted resources/quota, connection refused,
/// timeout exceeded.
static FATAL_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)all .*(providers?|keys?) .*(failed|unavailable|down)",
        r"(?i)total outage",
        r"(?i)(quota|credits?|resources?) .*(exhausted|depleted|exceeded)",
        r"(?i)insufficient (quota|credits?|resources?)",
        r"(?i)connection refused|econnrefused",
        r"(?i)time(d)?[ -]?out|timeout exceeded",
    ])
    .expect("fatal patterns are valid regexes")
});

pub fn is_fatal_message(message: &str) -> bool {
    FATAL_PATTERNS.is_match(message)
}

// ─── Alert ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Structured alert payload delivered to the sink.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub content: String,
    pub level: AlertLevel,
    pub source: String,
    pub tags: Vec<String>,
    /// Redacted context: task id, providers, truncated query, failure count.
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Contract for the external alerting collaborator.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Discards every alert. Default when no webhook is configured.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        debug!(title = %alert.title, "alert dropped (no sink configured)");
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook endpoint.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let resp = self.client.post(&self.url).json(alert).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned {}", resp.status());
        }
        Ok(())
    }
}

// ─── Failure monitor ─────────────────────────────────────────────────────────

/// Sliding-window failure counter plus the escalation decision.
pub struct FailureMonitor {
    config: NotifyConfig,
    failures: Mutex<VecDeque<DateTime<Utc>>>,
    sink: Arc<dyn NotificationSink>,
}

impl FailureMonitor {
    pub fn new(config: NotifyConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            config,
            failures: Mutex::new(VecDeque::new()),
            sink,
        }
    }

    /// Record a terminal failure and, if the heuristics fire, dispatch an
    /// alert in the background. Never blocks on, or errors from, delivery.
    pub async fn on_task_failed(&self, task_id: &str, params: &RequestParams, error: &str) {
        let count = self.record(Utc::now()).await;
        let threshold_hit = count >= self.config.failure_threshold;
        let fatal = is_fatal_message(error);

        if !threshold_hit && !fatal {
            return;
        }

        let alert = self.build_alert(task_id, params, error, count, fatal);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.send(&alert).await {
                warn!(alert_id = %alert.id, "alert delivery failed: {e:#}");
            }
        });
    }

    /// Count of failures in the trailing window after recording one at `at`.
    async fn record(&self, at: DateTime<Utc>) -> u64 {
        let cutoff = at - Duration::seconds(self.config.failure_window_secs as i64);
        let mut failures = self.failures.lock().await;
        while failures.front().is_some_and(|t| *t <= cutoff) {
            failures.pop_front();
        }
        failures.push_back(at);
        failures.len() as u64
    }

    fn build_alert(
        &self,
        task_id: &str,
        params: &RequestParams,
        error: &str,
        failure_count: u64,
        fatal: bool,
    ) -> Alert {
        let mut query = params.query.clone();
        if query.len() > self.config.query_redact_len {
            query.truncate(
                query
                    .char_indices()
                    .take(self.config.query_redact_len)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0),
            );
            query.push('…');
        }

        let mut tags = vec!["research".to_string(), "task-failure".to_string()];
        if fatal {
            tags.push("fatal-pattern".to_string());
        }

        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            title: format!("research task failed ({failure_count} in window)"),
            content: error.to_string(),
            level: AlertLevel::Critical,
            source: "researchd".to_string(),
            tags,
            extra: serde_json::json!({
                "taskId": task_id,
                "provider": params.provider,
                "models": params.models,
                "query": query,
                "failureCount": failure_count,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            created_at: Utc::now(),
        }
    }
}
