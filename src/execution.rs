//! Execution Handle contract — the opaque multi-stage research pipeline.
//!
//! The pipeline is an external collaborator: the core starts it, consumes
//! its event stream, and waits for the final result. Events arrive over a
//! bounded channel rather than a mutable callback field, so subscription is
//! explicit and the handle stays immutable after construction. Once started,
//! a handle runs to completion or failure from the pipeline's perspective —
//! the core has no cancellation lever, and evicting a task's registry entry
//! does not stop its underlying work.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::fingerprint::RequestParams;

/// Buffered events per execution before the pipeline back-pressures.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress events emitted by a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// A streamed output text chunk. Appended to the task's outputs.
    Message(String),
    /// Stage transition within the pipeline.
    Progress { step: String, percentage: u8 },
    /// A non-fatal pipeline error notice. Fatal errors surface through the
    /// `run` return value instead.
    Error(String),
}

/// The research pipeline invocation.
///
/// `run` resolves with the final result payload, or an error that marks the
/// task failed. Implementations send [`ExecutionEvent`]s on `events` as work
/// progresses; dropping the sender early is fine — the result is what
/// completes the task.
#[async_trait]
pub trait ExecutionHandle: Send + Sync + 'static {
    async fn run(
        &self,
        params: &RequestParams,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> anyhow::Result<serde_json::Value>;
}
