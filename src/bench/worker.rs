//! Timed worker loop
//!
//! Runs a workload back to back until a wall-clock deadline passes. The
//! deadline is checked between invocations only, so the measured elapsed
//! time may overrun the configured duration by up to one invocation.
//! Cancellation also reaches into a running invocation through the kernel
//! scratch; an interrupted invocation is not counted.

use crate::bench::kernels::{KernelError, KernelScratch, Workload};
use crate::models::WorkerResult;
use std::hint::black_box;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How a worker loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The deadline passed or the loop was cancelled
    Completed(WorkerResult),
    /// An invocation failed; `partial` holds the work done before it
    Failed {
        partial: WorkerResult,
        error: KernelError,
    },
}

impl WorkerOutcome {
    pub fn result(&self) -> &WorkerResult {
        match self {
            WorkerOutcome::Completed(result) => result,
            WorkerOutcome::Failed { partial, .. } => partial,
        }
    }
}

/// A single worker that saturates one core until its deadline
pub struct TimedWorker<W> {
    id: usize,
    workload: W,
    duration: Duration,
    cancel: CancellationToken,
    seed: Option<u64>,
}

impl<W: Workload> TimedWorker<W> {
    pub fn new(id: usize, workload: W, duration: Duration) -> Self {
        Self {
            id,
            workload,
            duration,
            cancel: CancellationToken::new(),
            seed: None,
        }
    }

    /// Stop early once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed the worker's private RNG
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Run the loop on the current thread.
    ///
    /// Never yields between invocations; call it from a blocking thread.
    pub fn run(self) -> WorkerOutcome {
        let mut scratch = KernelScratch::new(self.seed).with_cancel(self.cancel.clone());
        let start = Instant::now();
        let deadline = start.checked_add(self.duration);

        trace!(worker_id = self.id, duration = ?self.duration, "Worker started");

        if self.workload.is_noop() {
            debug!(worker_id = self.id, "Workload parameters ask for no work");
            return WorkerOutcome::Completed(WorkerResult::new(self.id, 0, start.elapsed(), 0, 0));
        }

        let mut operations = 0u64;
        let mut bytes_allocated = 0u64;
        let mut checksum = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                debug!(worker_id = self.id, operations, "Worker cancelled");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            match self.workload.invoke(&mut scratch) {
                Ok(_) if self.cancel.is_cancelled() => {
                    debug!(worker_id = self.id, operations, "Worker interrupted mid-invocation");
                    break;
                }
                Ok(outcome) if outcome.is_idle() => break,
                Ok(outcome) => {
                    operations += 1;
                    bytes_allocated = bytes_allocated.saturating_add(outcome.bytes_allocated);
                    checksum ^= outcome.checksum;
                }
                Err(error) => {
                    warn!(worker_id = self.id, operations, %error, "Worker invocation failed");
                    let partial = WorkerResult::new(
                        self.id,
                        operations,
                        start.elapsed(),
                        bytes_allocated,
                        scratch.retained_items(),
                    );
                    return WorkerOutcome::Failed { partial, error };
                }
            }
        }

        black_box(checksum);
        let elapsed = start.elapsed();
        debug!(worker_id = self.id, operations, ?elapsed, "Worker finished");

        WorkerOutcome::Completed(WorkerResult::new(
            self.id,
            operations,
            elapsed,
            bytes_allocated,
            scratch.retained_items(),
        ))
    }
}
