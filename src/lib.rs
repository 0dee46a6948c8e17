pub mod config;
pub mod connections;
pub mod error;
pub mod execution;
pub mod fingerprint;
pub mod gate;
pub mod manager;
pub mod notify;
pub mod persistence;
pub mod pressure;
pub mod registry;
pub mod validation;

pub use error::{Result, TaskError};
pub use execution::{ExecutionEvent, ExecutionHandle};
pub use fingerprint::{task_id_for, RequestParams};
pub use manager::{HealthStatus, StartOutcome, TaskManager};
pub use validation::ValidationResult;
