use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_MAX_TASKS: usize = 1000;
const DEFAULT_MAX_CONCURRENT: usize = 5;

fn default_data_dir() -> PathBuf {
    dirs_fallback().join(".researchd")
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

// ─── RegistryConfig ──────────────────────────────────────────────────────────

/// Task registry limits (`[registry]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum tracked tasks. Inserting past this triggers an eviction pass;
    /// `MaxTasksReached` if the registry is still full afterwards.
    pub max_tasks: usize,
    /// Registry occupancy the eviction sweep drives down to, as a fraction
    /// of `max_tasks` (default: 0.8).
    pub target_occupancy: f64,
    /// Output-chunk count above which a task is eligible for truncation
    /// under warning pressure.
    pub output_chunk_cap: usize,
    /// Fraction of chunks kept (most recent) when truncating (default: 0.8).
    pub output_keep_ratio: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            target_occupancy: 0.8,
            output_chunk_cap: 500,
            output_keep_ratio: 0.8,
        }
    }
}

// ─── GateConfig ──────────────────────────────────────────────────────────────

/// Concurrency gate limits (`[gate]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// Global ceiling on simultaneously running executions.
    pub max_concurrent: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

// ─── ValidationConfig ────────────────────────────────────────────────────────

/// Result integrity thresholds (`[validation]` in config.toml).
///
/// A completed task is only trusted when its concatenated outputs contain
/// both markers and reach the minimum length — guards against partially
/// written or prematurely truncated results.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub start_marker: String,
    pub end_marker: String,
    /// Minimum total concatenated-output length, inclusive.
    pub min_output_len: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            start_marker: "<report>".to_string(),
            end_marker: "</report>".to_string(),
            min_output_len: 500,
        }
    }
}

// ─── PressureConfig ──────────────────────────────────────────────────────────

/// Memory pressure monitor tuning (`[pressure]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Monitor tick while pressure is normal, in seconds.
    pub poll_interval_secs: u64,
    /// Monitor tick while pressure is warning or worse, in seconds.
    pub fast_poll_interval_secs: u64,
    /// Heap usage as % of the budget at which each level begins.
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub emergency_percent: f64,
    /// Completed tasks older than this are removed under critical pressure
    /// (halved under sustained pressure), in seconds.
    pub completed_age_secs: u64,
    /// Age floor for the emergency sweep, in seconds.
    pub emergency_age_floor_secs: u64,
    /// Fraction of eligible completed tasks the emergency sweep may delete.
    pub emergency_delete_ratio: f64,
    /// Samples at warning-or-worse before thresholds are considered
    /// "sustained" and the age threshold tightens.
    pub sustained_samples: u32,
    /// Cleanup-priority weights (see eviction policy).
    pub weight_age: f64,
    pub weight_idle: f64,
    pub weight_value: f64,
    pub weight_status: f64,
    /// Hard ceilings: a task older than `hard_age_secs` AND unread for
    /// `hard_idle_secs` is force-prioritised regardless of score.
    pub hard_age_secs: u64,
    pub hard_idle_secs: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            fast_poll_interval_secs: 60,
            warning_percent: 50.0,
            critical_percent: 65.0,
            emergency_percent: 80.0,
            completed_age_secs: 3600,
            emergency_age_floor_secs: 600,
            emergency_delete_ratio: 0.5,
            sustained_samples: 3,
            weight_age: 1.0,
            weight_idle: 1.5,
            weight_value: 0.4,
            weight_status: 10.0,
            hard_age_secs: 7 * 24 * 3600,
            hard_idle_secs: 24 * 3600,
        }
    }
}

// ─── ConnectionConfig ────────────────────────────────────────────────────────

/// Subscriber accounting limits (`[connections]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum subscribers per task.
    pub max_per_task: usize,
    /// Global ceiling as a multiple of `registry.max_tasks`.
    pub global_multiplier: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_per_task: 3,
            global_multiplier: 2,
        }
    }
}

// ─── NotifyConfig ────────────────────────────────────────────────────────────

/// Critical-failure alerting (`[notify]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook endpoint for alerts. None disables the shipped sink.
    pub webhook_url: Option<String>,
    /// Trailing window for failure counting, in seconds.
    pub failure_window_secs: u64,
    /// Failures within the window that trigger an alert.
    pub failure_threshold: u64,
    /// Query text is truncated to this many chars before leaving the process.
    pub query_redact_len: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            failure_window_secs: 300,
            failure_threshold: 3,
            query_redact_len: 80,
        }
    }
}

// ─── Top-level config ────────────────────────────────────────────────────────

/// Daemon configuration, layered highest-priority first:
///   1. CLI / env — passed as `Some(value)` from clap
///   2. TOML file at `{data_dir}/config.toml`
///   3. Built-in defaults
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json".
    pub log_format: String,
    pub registry: RegistryConfig,
    pub gate: GateConfig,
    pub validation: ValidationConfig,
    pub pressure: PressureConfig,
    pub connections: ConnectionConfig,
    pub notify: NotifyConfig,
}

/// Shape of `{data_dir}/config.toml`. All sections optional.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    log: Option<String>,
    log_format: Option<String>,
    registry: Option<RegistryConfig>,
    gate: Option<GateConfig>,
    validation: Option<ValidationConfig>,
    pressure: Option<PressureConfig>,
    connections: Option<ConnectionConfig>,
    notify: Option<NotifyConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let raw = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("ignoring malformed {}: {e}", path.display());
            None
        }
    }
}

impl DaemonConfig {
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let log_format = std::env::var("RESEARCHD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let mut notify = toml.notify.unwrap_or_default();
        if let Ok(url) = std::env::var("RESEARCHD_WEBHOOK_URL") {
            if !url.is_empty() {
                notify.webhook_url = Some(url);
            }
        }

        Self {
            data_dir,
            log,
            log_format,
            registry: toml.registry.unwrap_or_default(),
            gate: toml.gate.unwrap_or_default(),
            validation: toml.validation.unwrap_or_default(),
            pressure: toml.pressure.unwrap_or_default(),
            connections: toml.connections.unwrap_or_default(),
            notify,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log: "info".to_string(),
            log_format: "pretty".to_string(),
            registry: RegistryConfig::default(),
            gate: GateConfig::default(),
            validation: ValidationConfig::default(),
            pressure: PressureConfig::default(),
            connections: ConnectionConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = DaemonConfig::default();
        assert_eq!(c.gate.max_concurrent, 5);
        assert_eq!(c.registry.max_tasks, 1000);
        assert!(c.registry.target_occupancy < 1.0);
        assert!(c.pressure.warning_percent < c.pressure.critical_percent);
        assert!(c.pressure.critical_percent < c.pressure.emergency_percent);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "log = \"debug\"\n[gate]\nmax_concurrent = 2\n[validation]\nmin_output_len = 42\n",
        )
        .unwrap();
        let c = DaemonConfig::new(Some(dir.path().to_path_buf()), None);
        assert_eq!(c.log, "debug");
        assert_eq!(c.gate.max_concurrent, 2);
        assert_eq!(c.validation.min_output_len, 42);
        // Untouched sections keep defaults.
        assert_eq!(c.registry.max_tasks, 1000);
    }

    #[test]
    fn malformed_toml_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not [valid").unwrap();
        let c = DaemonConfig::new(Some(dir.path().to_path_buf()), None);
        assert_eq!(c.gate.max_concurrent, 5);
    }
}
