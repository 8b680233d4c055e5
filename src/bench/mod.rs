//! Workload engine module
//!
//! Contains the synthetic kernels, the timed worker loop and the
//! orchestrator that fans workers out and collects their results.

pub mod kernels;
pub mod orchestrator;
pub mod worker;

// Re-export commonly used types
pub use kernels::{KernelError, KernelOutcome, KernelScratch, RetentionPolicy, Workload, WorkloadKernel};
pub use orchestrator::{Orchestrator, RunPhase, WorkerInfo, WorkerStatus};
pub use worker::{TimedWorker, WorkerOutcome};

use crate::config::RunConfig;
use crate::models::RunReport;
use crate::Result;

/// Run a workload with process telemetry
pub async fn run_workload(config: RunConfig) -> Result<RunReport> {
    Orchestrator::new().run(config).await
}

/// Blocking variant of [`run_workload`] for callers without a runtime.
///
/// Builds a private current-thread runtime; workers still run in parallel
/// on its blocking pool. Abandoned workers are not waited for on shutdown.
pub fn run_workload_blocking(config: RunConfig) -> Result<RunReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(run_workload(config));
    runtime.shutdown_background();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_blocking_entry_point() {
        let config = RunConfig::new(2, Duration::from_millis(50), WorkloadKernel::MathCompute { iterations: 100 });
        let report = run_workload_blocking(config).unwrap();
        assert_eq!(report.worker_results.len(), 2);
        assert!(report.total_operations > 0);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_blocking_entry_point_rejects() {
        let config = RunConfig::new(1, Duration::from_secs(7200), WorkloadKernel::Fibonacci { n: 10 });
        let err = run_workload_blocking(config).unwrap_err();
        assert!(crate::error::is_rejection(&err));
    }
}
