//! STRESSORB - Stress Orchestration Rust Bench
//!
//! Runs time-boxed CPU and allocation workloads across many workers and
//! reports per-worker throughput alongside before/after memory telemetry.

use std::fmt;

pub mod bench;
pub mod config;
pub mod models;
pub mod telemetry;
pub mod util;

pub use bench::{run_workload, run_workload_blocking, Orchestrator};
pub use config::{RunConfig, RunRequest};
pub use models::RunReport;
pub use telemetry::{capture_telemetry_snapshot, TelemetryDelta, TelemetrySnapshot};

#[derive(Debug)]
pub enum StressOrbError {
    /// Invalid run configuration; the run is rejected before any work starts
    ConfigError(String),
    /// A worker ran out of a runtime resource (typically memory) mid-run
    WorkerResourceError(String),
    /// Joining the workers exceeded the overall run bound
    OrchestrationTimeout(String),
    /// A runtime introspection source could not be read
    TelemetryUnavailable(String),
    /// I/O operation failed
    IoError(std::io::Error),
    /// Settings file could not be read, parsed or written
    SettingsError(String),
}

impl fmt::Display for StressOrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressOrbError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            StressOrbError::WorkerResourceError(msg) => write!(f, "Worker resource error: {}", msg),
            StressOrbError::OrchestrationTimeout(msg) => write!(f, "Orchestration timeout: {}", msg),
            StressOrbError::TelemetryUnavailable(msg) => write!(f, "Telemetry unavailable: {}", msg),
            StressOrbError::IoError(err) => write!(f, "I/O error: {}", err),
            StressOrbError::SettingsError(msg) => write!(f, "Settings error: {}", msg),
        }
    }
}

impl std::error::Error for StressOrbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StressOrbError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StressOrbError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::OutOfMemory => {
                StressOrbError::WorkerResourceError(format!("Out of memory: {}", err))
            }
            _ => StressOrbError::IoError(err),
        }
    }
}

impl From<serde_json::Error> for StressOrbError {
    fn from(err: serde_json::Error) -> Self {
        StressOrbError::SettingsError(format!("JSON serialization error: {}", err))
    }
}

impl From<toml::de::Error> for StressOrbError {
    fn from(err: toml::de::Error) -> Self {
        StressOrbError::SettingsError(format!("TOML parsing error: {}", err))
    }
}

impl From<toml::ser::Error> for StressOrbError {
    fn from(err: toml::ser::Error) -> Self {
        StressOrbError::SettingsError(format!("TOML serialization error: {}", err))
    }
}

/// Result type alias for STRESSORB operations
pub type Result<T> = std::result::Result<T, StressOrbError>;

/// Error classification helpers
pub mod error {
    use super::StressOrbError;

    /// Whether the error rejects a run outright.
    ///
    /// Only configuration problems are surfaced to the caller; everything
    /// that happens once workers are running is recorded in the report.
    pub fn is_rejection(error: &StressOrbError) -> bool {
        matches!(error, StressOrbError::ConfigError(_))
    }

    /// Convert error to user-friendly message with suggestions
    pub fn user_friendly_message(error: &StressOrbError) -> String {
        match error {
            StressOrbError::ConfigError(msg) => {
                format!("Configuration error: {}. Check the worker count and duration.", msg)
            }
            StressOrbError::WorkerResourceError(_) => {
                "A worker ran out of memory. Lower the chunk size or the retention ceiling."
                    .to_string()
            }
            StressOrbError::OrchestrationTimeout(_) => {
                "Workers did not finish in time. Increase the join grace period.".to_string()
            }
            StressOrbError::TelemetryUnavailable(_) => {
                "Some memory metrics could not be read on this platform.".to_string()
            }
            StressOrbError::SettingsError(_) => {
                "Failed to load or save settings. Check the settings file syntax and permissions."
                    .to_string()
            }
            _ => error.to_string(),
        }
    }
}

pub const APP_NAME: &str = "stressorb";
pub const CONFIG_FILE: &str = "stressorb.toml";
pub const MAX_CONCURRENCY: usize = 256;
