//! Workload orchestration
//!
//! Validates a run, brackets the worker fan-out with two telemetry
//! snapshots and folds everything the workers report into a `RunReport`.
//! Workers run on tokio's blocking pool; the join is bounded by the
//! per-worker duration plus a grace period, after which stragglers are
//! abandoned and told to stop through a cancellation token.

use crate::bench::kernels::Workload;
use crate::bench::worker::{TimedWorker, WorkerOutcome};
use crate::config::RunConfig;
use crate::models::{FailureKind, RunReport, WorkerFailure, WorkerResult};
use crate::telemetry::{
    ProcessIntrospector, RuntimeIntrospector, TelemetrySnapshot, METRIC_COLLECTORS,
};
use crate::util::units::format_duration;
use crate::{Result, StressOrbError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Configured,
    SnapshotBefore,
    WorkersRunning,
    Joining,
    SnapshotAfter,
    /// Report built, complete or partial
    Aggregated,
    /// Validation failed: no snapshots, no workers
    Rejected,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Configured, SnapshotBefore)
                | (Configured, Rejected)
                | (SnapshotBefore, WorkersRunning)
                | (WorkersRunning, Joining)
                | (Joining, SnapshotAfter)
                | (SnapshotAfter, Aggregated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Aggregated | RunPhase::Rejected)
    }
}

/// Worker status for tracking individual worker states
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
    Running,
    Completed,
    /// Worker failed with an error
    Failed(String),
    /// Worker missed the join deadline
    Abandoned,
}

/// Individual worker information
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: usize,
    pub status: WorkerStatus,
}

impl WorkerInfo {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: WorkerStatus::Running,
        }
    }
}

/// Runs workloads and reports what happened
pub struct Orchestrator {
    introspector: Arc<dyn RuntimeIntrospector>,
    phase: RunPhase,
    workers: Vec<WorkerInfo>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Orchestrator reading telemetry from the current process
    pub fn new() -> Self {
        Self::with_introspector(Arc::new(ProcessIntrospector::new()))
    }

    pub fn with_introspector(introspector: Arc<dyn RuntimeIntrospector>) -> Self {
        Self {
            introspector,
            phase: RunPhase::Configured,
            workers: Vec::new(),
        }
    }

    /// Phase of the most recent run
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Get worker statuses of the most recent run
    pub fn worker_statuses(&self) -> Vec<(usize, WorkerStatus)> {
        self.workers.iter().map(|w| (w.id, w.status.clone())).collect()
    }

    /// Run the kernel named in `config`
    pub async fn run(&mut self, config: RunConfig) -> Result<RunReport> {
        let kernel = config.kernel.clone();
        self.run_custom(config, kernel).await
    }

    /// Run `workload` on every worker instead of `config.kernel`.
    ///
    /// The report still carries `config` unchanged.
    pub async fn run_custom<W>(&mut self, config: RunConfig, workload: W) -> Result<RunReport>
    where
        W: Workload + Clone + 'static,
    {
        self.phase = RunPhase::Configured;
        self.workers.clear();

        if let Err(err) = config.validate() {
            warn!("Rejecting run: {}", err);
            self.transition(RunPhase::Rejected);
            return Err(err);
        }

        info!(
            kernel = config.kernel.name(),
            workers = config.concurrency,
            duration = ?config.duration_per_worker,
            "Starting workload run"
        );

        self.transition(RunPhase::SnapshotBefore);
        let before = TelemetrySnapshot::capture(self.introspector.as_ref());
        let logical_cpus = self.introspector.logical_cpus();
        let started_at = Utc::now();

        self.transition(RunPhase::WorkersRunning);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut handles = Vec::with_capacity(config.concurrency);

        for id in 0..config.concurrency {
            let worker = TimedWorker::new(id, workload.clone(), config.duration_per_worker)
                .with_cancel(cancel.child_token())
                .with_seed(config.seed.map(|seed| seed.wrapping_add(id as u64)));
            handles.push((id, tokio::task::spawn_blocking(move || worker.run())));
            self.workers.push(WorkerInfo::new(id));
        }

        self.transition(RunPhase::Joining);
        let join_deadline = config.join_deadline();
        let deadline = tokio::time::Instant::from_std(start + join_deadline);
        let mut results: Vec<WorkerResult> = Vec::with_capacity(config.concurrency);
        let mut failures = Vec::new();
        let mut timed_out = false;

        for (id, handle) in handles {
            // a handle dropped on timeout detaches its thread
            let (status, failure) = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(WorkerOutcome::Completed(result))) => {
                    results.push(result);
                    (WorkerStatus::Completed, None)
                }
                Ok(Ok(WorkerOutcome::Failed { partial, error })) => {
                    let message = StressOrbError::from(error).to_string();
                    let failure = WorkerFailure {
                        worker_id: id,
                        kind: FailureKind::ResourceExhausted,
                        message: message.clone(),
                        operations_completed: Some(partial.operations),
                    };
                    (WorkerStatus::Failed(message), Some(failure))
                }
                Ok(Err(join_error)) => {
                    let message = panic_message(join_error);
                    let failure = WorkerFailure {
                        worker_id: id,
                        kind: FailureKind::Panicked,
                        message: message.clone(),
                        operations_completed: None,
                    };
                    (WorkerStatus::Failed(message), Some(failure))
                }
                Err(_) => {
                    timed_out = true;
                    let message = StressOrbError::OrchestrationTimeout(format!(
                        "worker {} still running after {:?}",
                        id, join_deadline
                    ))
                    .to_string();
                    let failure = WorkerFailure {
                        worker_id: id,
                        kind: FailureKind::Abandoned,
                        message,
                        operations_completed: None,
                    };
                    (WorkerStatus::Abandoned, Some(failure))
                }
            };

            if let Some(failure) = failure {
                warn!(worker_id = id, kind = ?failure.kind, "{}", failure.message);
                failures.push(failure);
            }
            self.set_status(id, status);
        }

        // abandoned workers notice this within one cancellation check
        cancel.cancel();
        let actual_wall_duration = start.elapsed();
        if timed_out {
            warn!(
                abandoned = failures.iter().filter(|f| f.kind == FailureKind::Abandoned).count(),
                "Join deadline passed, reporting partial run"
            );
        }

        self.transition(RunPhase::SnapshotAfter);
        let after = TelemetrySnapshot::capture(self.introspector.as_ref());
        let telemetry_delta = before.delta_to(&after);

        let collector_telemetry = if telemetry_delta
            .unavailable
            .iter()
            .any(|m| m == METRIC_COLLECTORS)
        {
            "unavailable"
        } else {
            "available"
        };

        let report = RunReport::assemble(
            config,
            started_at,
            logical_cpus,
            results,
            failures,
            timed_out,
            actual_wall_duration,
            telemetry_delta,
        )
        .with_extra("collector_telemetry", collector_telemetry)
        .with_extra("join_deadline", format_duration(join_deadline));

        self.transition(RunPhase::Aggregated);
        info!(
            total_operations = report.total_operations,
            ops_per_sec = report.aggregate_operations_per_second,
            partial = report.partial,
            "Workload run finished"
        );

        Ok(report)
    }

    fn transition(&mut self, next: RunPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid run phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(from = ?self.phase, to = ?next, "Run phase transition");
        self.phase = next;
    }

    fn set_status(&mut self, id: usize, status: WorkerStatus) {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) {
            worker.status = status;
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "worker task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("worker panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::kernels::{KernelError, KernelOutcome, KernelScratch, WorkloadKernel};
    use crate::telemetry::testing::{Frame, ScriptedIntrospector};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn fibonacci_config(workers: usize, duration: Duration) -> RunConfig {
        RunConfig::new(workers, duration, WorkloadKernel::Fibonacci { n: 200 })
    }

    fn scripted() -> Arc<ScriptedIntrospector> {
        Arc::new(ScriptedIntrospector::new(vec![
            Frame::new(&[("small-object", 100, None), ("large-object", 4, Some(2))], 8192),
            Frame::new(&[("small-object", 160, None), ("large-object", 9, Some(5))], 4096),
        ]))
    }

    /// Busy-waits for a fixed cost per invocation
    #[derive(Clone)]
    struct Spin(Duration);

    impl Workload for Spin {
        fn invoke(&self, _scratch: &mut KernelScratch) -> std::result::Result<KernelOutcome, KernelError> {
            let start = Instant::now();
            while start.elapsed() < self.0 {
                std::hint::spin_loop();
            }
            Ok(KernelOutcome {
                units: 1,
                checksum: 0,
                bytes_allocated: 0,
            })
        }
    }

    /// The first invocation anywhere trips the flag and misbehaves
    #[derive(Clone)]
    struct FirstCaller {
        tripped: Arc<AtomicBool>,
        mode: Misbehave,
    }

    #[derive(Clone, Copy)]
    enum Misbehave {
        Fail,
        Panic,
        Stall(Duration),
    }

    impl FirstCaller {
        fn new(mode: Misbehave) -> Self {
            Self {
                tripped: Arc::new(AtomicBool::new(false)),
                mode,
            }
        }
    }

    impl Workload for FirstCaller {
        fn invoke(&self, scratch: &mut KernelScratch) -> std::result::Result<KernelOutcome, KernelError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                match self.mode {
                    Misbehave::Fail => {
                        return Err(KernelError::AllocationFailed { requested: 1 << 40 })
                    }
                    Misbehave::Panic => panic!("kernel blew up"),
                    Misbehave::Stall(pause) => std::thread::sleep(pause),
                }
            }
            Spin(Duration::from_millis(1)).invoke(scratch)
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_snapshots() {
        let introspector = scripted();
        let mut orchestrator = Orchestrator::with_introspector(introspector.clone());

        let result = orchestrator
            .run(fibonacci_config(0, Duration::from_secs(1)))
            .await;

        assert!(matches!(result, Err(StressOrbError::ConfigError(_))));
        assert_eq!(orchestrator.phase(), RunPhase::Rejected);
        assert_eq!(introspector.captures(), 0);
        assert!(orchestrator.worker_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_complete_run_reports_every_worker() {
        let introspector = scripted();
        let mut orchestrator = Orchestrator::with_introspector(introspector.clone());

        let report = orchestrator
            .run(fibonacci_config(3, Duration::from_millis(200)).with_seed(11))
            .await
            .unwrap();

        assert_eq!(orchestrator.phase(), RunPhase::Aggregated);
        assert!(orchestrator.phase().is_terminal());
        assert_eq!(report.worker_results.len(), 3);
        assert!(!report.partial);
        assert!(!report.timed_out);
        assert!(report.is_consistent());
        assert!(report.actual_wall_duration >= Duration::from_millis(200));
        assert_eq!(report.logical_cpus, 4);
        let ids: Vec<usize> = report.worker_results.iter().map(|r| r.worker_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(orchestrator
            .worker_statuses()
            .iter()
            .all(|(_, status)| *status == WorkerStatus::Completed));
    }

    #[tokio::test]
    async fn test_snapshots_bracket_the_run() {
        let introspector = scripted();
        let mut orchestrator = Orchestrator::with_introspector(introspector.clone());

        let report = orchestrator
            .run(fibonacci_config(1, Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(introspector.captures(), 2);
        let delta = &report.telemetry_delta;
        assert_eq!(delta.collection_counts["small-object"], 60);
        assert_eq!(delta.collection_counts["large-object"], 5);
        assert_eq!(delta.collection_pause_ms["large-object"], 3);
        assert_eq!(delta.heap_used_change, Some(-4096));
        assert_eq!(
            report.extra.get("collector_telemetry").map(String::as_str),
            Some("available")
        );
    }

    #[tokio::test]
    async fn test_zero_duration_returns_promptly() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let start = Instant::now();

        let report = orchestrator
            .run(fibonacci_config(4, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(report.worker_results.len(), 4);
        assert_eq!(report.total_operations, 0);
        assert!(!report.partial);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failing_worker_does_not_abort_siblings() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let config = fibonacci_config(3, Duration::from_millis(100));

        let report = orchestrator
            .run_custom(config, FirstCaller::new(Misbehave::Fail))
            .await
            .unwrap();

        assert!(report.partial);
        assert!(!report.timed_out);
        assert_eq!(report.worker_results.len(), 2);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.kind, FailureKind::ResourceExhausted);
        assert_eq!(failure.operations_completed, Some(0));
        assert!(report.worker_results.iter().all(|r| r.operations > 0));
        assert!(report
            .worker_results
            .iter()
            .all(|r| r.worker_id != failure.worker_id));
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_recorded() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let config = fibonacci_config(2, Duration::from_millis(50));

        let report = orchestrator
            .run_custom(config, FirstCaller::new(Misbehave::Panic))
            .await
            .unwrap();

        assert!(report.partial);
        assert_eq!(report.worker_results.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Panicked);
        assert!(report.failures[0].message.contains("kernel blew up"));
        let failed_id = report.failures[0].worker_id;
        assert!(orchestrator
            .worker_statuses()
            .iter()
            .any(|(id, status)| *id == failed_id && matches!(status, WorkerStatus::Failed(_))));
    }

    #[tokio::test]
    async fn test_straggler_is_abandoned_after_grace() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let config = fibonacci_config(2, Duration::from_millis(50))
            .with_join_grace(Duration::from_millis(100));

        let start = Instant::now();
        let report = orchestrator
            .run_custom(config, FirstCaller::new(Misbehave::Stall(Duration::from_millis(800))))
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(700));
        assert!(report.timed_out);
        assert!(report.partial);
        assert_eq!(report.worker_results.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Abandoned);
        assert!(orchestrator
            .worker_statuses()
            .iter()
            .any(|(_, status)| *status == WorkerStatus::Abandoned));
    }

    /// Counts invocations that have returned, interrupted or not
    #[derive(Clone)]
    struct Returns {
        kernel: WorkloadKernel,
        returned: Arc<AtomicUsize>,
    }

    impl Workload for Returns {
        fn invoke(&self, scratch: &mut KernelScratch) -> std::result::Result<KernelOutcome, KernelError> {
            let outcome = self.kernel.invoke(scratch);
            self.returned.fetch_add(1, Ordering::SeqCst);
            outcome
        }
    }

    #[tokio::test]
    async fn test_abandoned_worker_stops_mid_invocation() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let config = fibonacci_config(1, Duration::from_millis(10))
            .with_join_grace(Duration::from_millis(50));
        let returned = Arc::new(AtomicUsize::new(0));
        // several seconds of work per invocation if left alone
        let workload = Returns {
            kernel: WorkloadKernel::MathCompute {
                iterations: 100_000_000,
            },
            returned: returned.clone(),
        };

        let report = orchestrator.run_custom(config, workload).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.failures[0].kind, FailureKind::Abandoned);

        let start = Instant::now();
        while returned.load(Ordering::SeqCst) == 0 {
            assert!(
                start.elapsed() < Duration::from_millis(500),
                "abandoned invocation kept running"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_fixed_cost_throughput() {
        let mut orchestrator = Orchestrator::with_introspector(scripted());
        let config = fibonacci_config(1, Duration::from_millis(500));

        let report = orchestrator
            .run_custom(config, Spin(Duration::from_millis(10)))
            .await
            .unwrap();

        let result = &report.worker_results[0];
        // one invocation of overrun at most, plus scheduling noise
        assert!(result.elapsed >= Duration::from_millis(500));
        assert!(result.elapsed < Duration::from_millis(600));
        assert!(result.operations >= 30 && result.operations <= 51);
        assert!(result.operations_per_second > 50.0 && result.operations_per_second <= 101.0);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(RunPhase::Configured.can_transition_to(RunPhase::SnapshotBefore));
        assert!(RunPhase::Configured.can_transition_to(RunPhase::Rejected));
        assert!(!RunPhase::Configured.can_transition_to(RunPhase::WorkersRunning));
        assert!(!RunPhase::Joining.can_transition_to(RunPhase::Aggregated));
        assert!(!RunPhase::Rejected.can_transition_to(RunPhase::SnapshotBefore));
        assert!(RunPhase::Rejected.is_terminal());
        assert!(!RunPhase::SnapshotAfter.is_terminal());
    }
}
