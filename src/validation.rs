//! Validation Service — classifies a previously-seen task as directly
//! reusable, still running, or unusable.
//!
//! `completed` status alone is never trusted: the stored result must also
//! pass a content-integrity check (both report markers present, minimum
//! concatenated length) before it is returned to a caller. Failing that
//! check is not an error — it is classified as a cache miss (`Invalid`) so a
//! fresh attempt can proceed transparently while the old record is archived.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::persistence::TaskStore;
use crate::registry::model::TaskStatus;
use crate::registry::TaskRegistry;

/// Tri-state reuse classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResult {
    /// Stored result is trustworthy — return it directly.
    Valid,
    /// An execution is still active; attach as a consumer instead of starting.
    Running,
    /// No usable record — a fresh execution is required.
    Invalid,
}

#[derive(Clone)]
pub struct ValidationService {
    config: ValidationConfig,
}

impl ValidationService {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Classify a task id.
    ///
    /// `force_restart` bypasses all checks and always yields `Invalid`,
    /// giving callers an explicit re-run override.
    pub async fn check(
        &self,
        registry: &TaskRegistry,
        store: &Arc<dyn TaskStore>,
        task_id: &str,
        force_restart: bool,
    ) -> ValidationResult {
        if force_restart {
            debug!(task_id, "validation bypassed by force_restart");
            return ValidationResult::Invalid;
        }

        // In-memory record is authoritative for liveness.
        if registry.status_of(task_id).await == Some(TaskStatus::Running) {
            return ValidationResult::Running;
        }

        let persisted = match store.get_task(task_id).await {
            Ok(p) => p,
            Err(e) => {
                // Degrade a durable read failure to a cache miss.
                warn!(task_id, "durable lookup failed during validation: {e:#}");
                return ValidationResult::Invalid;
            }
        };
        let Some(persisted) = persisted else {
            return ValidationResult::Invalid;
        };

        match persisted.status.as_str() {
            // Another attempt is still active per durable state.
            "running" => ValidationResult::Running,
            "completed" => {
                if self.is_result_complete(&persisted.outputs) {
                    ValidationResult::Valid
                } else {
                    debug!(task_id, "completed task failed content-integrity check");
                    ValidationResult::Invalid
                }
            }
            _ => ValidationResult::Invalid,
        }
    }

    /// Content-integrity check over the concatenated output chunks: both
    /// markers present and the total length at least the configured minimum.
    /// Guards against partially-written or prematurely truncated results.
    pub fn is_result_complete(&self, outputs: &[String]) -> bool {
        let joined = outputs.concat();
        joined.len() >= self.config.min_output_len
            && joined.contains(&self.config.start_marker)
            && joined.contains(&self.config.end_marker)
    }
}
