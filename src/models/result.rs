//! Run result data models
//!
//! Contains the per-worker results, failure records and the aggregate run
//! report returned by the orchestrator, plus read-only system information.

use crate::config::RunConfig;
use crate::telemetry::process::{self, MemoryFigures};
use crate::telemetry::{alloc, TelemetryDelta};
use crate::util::units::{calculate_ops_per_second, format_bytes, format_rate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of a single timed worker loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Worker identity, 0..concurrency
    pub worker_id: usize,
    /// Fully completed kernel invocations
    pub operations: u64,
    /// Actual wall time the loop ran for
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
    pub operations_per_second: f64,
    /// Bytes the kernel requested from the allocator
    pub bytes_allocated: u64,
    /// Items still retained by the worker when it exited
    pub retained_items: usize,
}

impl WorkerResult {
    pub fn new(
        worker_id: usize,
        operations: u64,
        elapsed: Duration,
        bytes_allocated: u64,
        retained_items: usize,
    ) -> Self {
        Self {
            worker_id,
            operations,
            elapsed,
            operations_per_second: calculate_ops_per_second(operations, elapsed),
            bytes_allocated,
            retained_items,
        }
    }
}

/// Why a worker did not contribute a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A kernel invocation hit a resource limit such as a failed allocation
    ResourceExhausted,
    /// The worker thread panicked
    Panicked,
    /// The worker missed the join deadline and was left to stop on its own
    Abandoned,
}

/// A worker that is missing from the report's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub kind: FailureKind,
    pub message: String,
    /// Invocations finished before the failure, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations_completed: Option<u64>,
}

/// Everything a single workload run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub started_at: DateTime<Utc>,
    pub logical_cpus: usize,
    /// Results of the workers that finished cleanly, ordered by worker id
    pub worker_results: Vec<WorkerResult>,
    pub total_operations: u64,
    pub aggregate_operations_per_second: f64,
    /// Allocation requests per second of wall time, when allocations are counted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocations_per_second: Option<f64>,
    /// Heap occupancy after the run as a percentage of the memory ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_usage_percent: Option<f64>,
    /// Resident memory after the run as a percentage of the memory ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_vs_limit_percent: Option<f64>,
    pub telemetry_delta: TelemetryDelta,
    #[serde(rename = "actual_wall_duration_ms", with = "duration_ms")]
    pub actual_wall_duration: Duration,
    /// True when not every configured worker contributed a result
    pub partial: bool,
    /// True when the join deadline passed before every worker returned
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<WorkerFailure>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl RunReport {
    /// Aggregate worker outcomes into a report
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: RunConfig,
        started_at: DateTime<Utc>,
        logical_cpus: usize,
        mut worker_results: Vec<WorkerResult>,
        mut failures: Vec<WorkerFailure>,
        timed_out: bool,
        actual_wall_duration: Duration,
        telemetry_delta: TelemetryDelta,
    ) -> Self {
        worker_results.sort_by_key(|r| r.worker_id);
        failures.sort_by_key(|f| f.worker_id);

        let total_operations: u64 = worker_results.iter().map(|r| r.operations).sum();
        let aggregate_operations_per_second =
            calculate_ops_per_second(total_operations, actual_wall_duration);
        let partial =
            timed_out || !failures.is_empty() || worker_results.len() != config.concurrency;

        let allocations_per_second = telemetry_delta
            .allocations
            .map(|count| calculate_ops_per_second(count, actual_wall_duration));
        let heap_usage_percent =
            percent_of(telemetry_delta.heap_used_after, telemetry_delta.heap_max_bytes);
        let resident_vs_limit_percent =
            percent_of(telemetry_delta.heap_committed_after, telemetry_delta.heap_max_bytes);

        Self {
            config,
            started_at,
            logical_cpus,
            worker_results,
            total_operations,
            aggregate_operations_per_second,
            allocations_per_second,
            heap_usage_percent,
            resident_vs_limit_percent,
            telemetry_delta,
            actual_wall_duration,
            partial,
            timed_out,
            failures,
            extra: BTreeMap::new(),
        }
    }

    /// Attach a free-form metadata entry
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Check the totals against the individual worker results
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.worker_results.iter().map(|r| r.operations).sum();
        sum == self.total_operations
            && self.worker_results.len() + self.failures.len() <= self.config.concurrency
    }

    /// Total bytes requested by all contributing workers
    pub fn total_bytes_allocated(&self) -> u64 {
        self.worker_results.iter().map(|r| r.bytes_allocated).sum()
    }

    /// Get a human-readable summary of the run
    pub fn summary(&self) -> String {
        format!(
            "{} - {} - {} workers - {} ops - {} - {} allocated{}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.config.kernel.description(),
            self.config.concurrency,
            self.total_operations,
            format_rate(self.aggregate_operations_per_second),
            format_bytes(self.total_bytes_allocated()),
            if self.partial { " (partial)" } else { "" }
        )
    }
}

fn percent_of(part: Option<u64>, whole: Option<u64>) -> Option<f64> {
    let whole = whole.filter(|w| *w > 0)?;
    Some(part? as f64 / whole as f64 * 100.0)
}

/// Read-only process and host information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Operating system and architecture
    pub os: String,
    pub logical_cpus: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_available: Option<u64>,
    /// Memory limit imposed by the enclosing container, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_memory_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_resident: Option<u64>,
    /// Whether the tracking allocator is installed in this process
    pub allocation_tracking: bool,
}

impl SystemInfo {
    /// Detect system information for the current process
    pub fn detect() -> Self {
        let memory = MemoryFigures::read();
        Self {
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            logical_cpus: process::logical_cpus(),
            memory_total: memory.total,
            memory_available: memory.available,
            container_memory_limit: memory.container_limit,
            process_resident: memory.process_resident,
            allocation_tracking: alloc::is_active(),
        }
    }
}

/// Serialize durations as fractional milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(millis / 1000.0))
    }
}
