//! Configuration management module
//!
//! Handles run configuration and its validation, the raw caller-facing run
//! request, and persisted harness settings.

use crate::bench::kernels::{RetentionPolicy, WorkloadKernel};
use crate::util::units::humantime_serde;
use crate::{Result, StressOrbError, MAX_CONCURRENCY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod settings;

pub use settings::{HarnessSettings, KernelDefaults};

/// Grace period added to the per-worker duration when joining workers
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(5);
/// Longest accepted per-worker duration
pub const MAX_DURATION: Duration = Duration::from_secs(3600);

const MAX_MATRIX_SIZE: usize = 2048;
const MAX_CHUNK_BYTES: usize = 1024 * 1024 * 1024;
const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;
/// Ceiling on per-invocation loop counts (iterations, n, rounds, candidates, chunks)
const MAX_KERNEL_ITERATIONS: u32 = 100_000_000;
/// Keeps a single trial division under a few million steps
const MAX_PRIME_RANGE_END: u64 = 1 << 48;

fn default_join_grace() -> Duration {
    DEFAULT_JOIN_GRACE
}

/// A validated-on-start description of one workload run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// How long every worker keeps invoking the kernel
    #[serde(with = "humantime_serde")]
    pub duration_per_worker: Duration,
    /// Extra time allowed for joining workers before they are abandoned
    #[serde(with = "humantime_serde", default = "default_join_grace")]
    pub join_grace: Duration,
    /// Base seed for the per-worker generators; entropy when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub kernel: WorkloadKernel,
}

impl RunConfig {
    pub fn new(concurrency: usize, duration_per_worker: Duration, kernel: WorkloadKernel) -> Self {
        Self {
            concurrency,
            duration_per_worker,
            join_grace: DEFAULT_JOIN_GRACE,
            seed: None,
            kernel,
        }
    }

    /// Set the per-worker duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_per_worker = duration;
        self
    }

    pub fn with_kernel(mut self, kernel: WorkloadKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    /// Make worker generators deterministic
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Overall bound on joining the workers
    pub fn join_deadline(&self) -> Duration {
        self.duration_per_worker.saturating_add(self.join_grace)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(StressOrbError::ConfigError(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.concurrency > MAX_CONCURRENCY {
            return Err(StressOrbError::ConfigError(format!(
                "Too many workers: {} (max: {})",
                self.concurrency, MAX_CONCURRENCY
            )));
        }

        if self.duration_per_worker > MAX_DURATION {
            return Err(StressOrbError::ConfigError(format!(
                "Duration too long: {}s (max: {}s)",
                self.duration_per_worker.as_secs(),
                MAX_DURATION.as_secs()
            )));
        }

        if self.join_grace > MAX_DURATION {
            return Err(StressOrbError::ConfigError(format!(
                "Join grace too long: {}s (max: {}s)",
                self.join_grace.as_secs(),
                MAX_DURATION.as_secs()
            )));
        }

        validate_kernel(&self.kernel)
    }
}

fn check_iterations(what: &str, value: u32) -> Result<()> {
    if value > MAX_KERNEL_ITERATIONS {
        return Err(StressOrbError::ConfigError(format!(
            "Too many {}: {} (max: {})",
            what, value, MAX_KERNEL_ITERATIONS
        )));
    }
    Ok(())
}

fn validate_kernel(kernel: &WorkloadKernel) -> Result<()> {
    match kernel {
        WorkloadKernel::MathCompute { iterations } => check_iterations("iterations", *iterations)?,
        WorkloadKernel::Fibonacci { n } => check_iterations("Fibonacci steps", *n)?,
        WorkloadKernel::PrimeCheck {
            candidates,
            range_start,
            range_end,
        } => {
            check_iterations("prime candidates", *candidates)?;
            if *candidates > 0 && range_start >= range_end {
                return Err(StressOrbError::ConfigError(format!(
                    "Prime range is empty: {}..{}",
                    range_start, range_end
                )));
            }
            if *range_end > MAX_PRIME_RANGE_END {
                return Err(StressOrbError::ConfigError(format!(
                    "Prime range end too large: {} (max: {})",
                    range_end, MAX_PRIME_RANGE_END
                )));
            }
        }
        WorkloadKernel::MatrixMultiply { size } => {
            if *size > MAX_MATRIX_SIZE {
                return Err(StressOrbError::ConfigError(format!(
                    "Matrix too large: {} (max: {})",
                    size, MAX_MATRIX_SIZE
                )));
            }
        }
        WorkloadKernel::ByteAllocation {
            chunk_bytes,
            chunks_per_invocation,
            ..
        } => {
            check_iterations("chunks", *chunks_per_invocation)?;
            if *chunk_bytes > MAX_CHUNK_BYTES {
                return Err(StressOrbError::ConfigError(format!(
                    "Chunk size too large: {} bytes (max: {} bytes)",
                    chunk_bytes, MAX_CHUNK_BYTES
                )));
            }
        }
        WorkloadKernel::MixedAllocationPattern {
            rounds, array_len, ..
        } => {
            check_iterations("rounds", *rounds)?;
            if *array_len > MAX_ARRAY_LEN {
                return Err(StressOrbError::ConfigError(format!(
                    "Array length too large: {} (max: {})",
                    array_len, MAX_ARRAY_LEN
                )));
            }
        }
    }
    Ok(())
}

/// Kernel selector used by requests and settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KernelName {
    #[default]
    Math,
    Prime,
    Fibonacci,
    Matrix,
    Bytes,
    Mixed,
}

impl KernelName {
    pub fn all() -> [KernelName; 6] {
        [
            KernelName::Math,
            KernelName::Prime,
            KernelName::Fibonacci,
            KernelName::Matrix,
            KernelName::Bytes,
            KernelName::Mixed,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelName::Math => "math",
            KernelName::Prime => "prime",
            KernelName::Fibonacci => "fibonacci",
            KernelName::Matrix => "matrix",
            KernelName::Bytes => "bytes",
            KernelName::Mixed => "mixed",
        }
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw run parameters as a caller parses them, before defaults and checks.
///
/// Numbers are signed so that nonsense such as a negative worker count
/// reaches validation instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub kernel: KernelName,
    pub workers: Option<i64>,
    pub duration_ms: Option<i64>,
    pub grace_ms: Option<i64>,
    pub seed: Option<u64>,
    /// Math iterations, Fibonacci `n` or mixed-pattern rounds
    pub iterations: Option<i64>,
    /// Matrix size or mixed-pattern array length
    pub size: Option<i64>,
    pub candidates: Option<i64>,
    pub range_start: Option<i64>,
    pub range_end: Option<i64>,
    pub chunk_bytes: Option<i64>,
    pub chunks: Option<i64>,
    pub max_retained: Option<i64>,
    pub discard_batch: Option<i64>,
    pub include_strings: Option<bool>,
    pub include_collections: Option<bool>,
    pub include_large_objects: Option<bool>,
}

impl RunRequest {
    pub fn new(kernel: KernelName) -> Self {
        Self {
            kernel,
            ..Self::default()
        }
    }

    /// Apply `settings` defaults and reject negative values
    pub fn into_config(self, settings: &HarnessSettings) -> Result<RunConfig> {
        let concurrency = match self.workers {
            Some(workers) => non_negative("worker count", workers)? as usize,
            None => settings.default_workers,
        };
        let duration = match self.duration_ms {
            Some(ms) => Duration::from_millis(non_negative("duration", ms)?),
            None => settings.default_duration,
        };
        let join_grace = match self.grace_ms {
            Some(ms) => Duration::from_millis(non_negative("join grace", ms)?),
            None => settings.join_grace,
        };

        let kernel = self.kernel_with_overrides(settings.kernels.kernel(self.kernel))?;

        Ok(RunConfig {
            concurrency,
            duration_per_worker: duration,
            join_grace,
            seed: self.seed,
            kernel,
        })
    }

    fn kernel_with_overrides(&self, kernel: WorkloadKernel) -> Result<WorkloadKernel> {
        let kernel = match kernel {
            WorkloadKernel::MathCompute { iterations } => WorkloadKernel::MathCompute {
                iterations: override_u32("iterations", self.iterations, iterations)?,
            },
            WorkloadKernel::Fibonacci { n } => WorkloadKernel::Fibonacci {
                n: override_u32("iterations", self.iterations, n)?,
            },
            WorkloadKernel::PrimeCheck {
                candidates,
                range_start,
                range_end,
            } => WorkloadKernel::PrimeCheck {
                candidates: override_u32("candidates", self.candidates, candidates)?,
                range_start: override_u64("range start", self.range_start, range_start)?,
                range_end: override_u64("range end", self.range_end, range_end)?,
            },
            WorkloadKernel::MatrixMultiply { size } => WorkloadKernel::MatrixMultiply {
                size: override_usize("size", self.size, size)?,
            },
            WorkloadKernel::ByteAllocation {
                chunk_bytes,
                chunks_per_invocation,
                retention,
            } => WorkloadKernel::ByteAllocation {
                chunk_bytes: override_usize("chunk size", self.chunk_bytes, chunk_bytes)?,
                chunks_per_invocation: override_u32("chunks", self.chunks, chunks_per_invocation)?,
                retention: self.retention_with_overrides(retention)?,
            },
            WorkloadKernel::MixedAllocationPattern {
                rounds,
                array_len,
                include_strings,
                include_collections,
                include_large_objects,
                retention,
            } => WorkloadKernel::MixedAllocationPattern {
                rounds: override_u32("iterations", self.iterations, rounds)?,
                array_len: override_usize("size", self.size, array_len)?,
                include_strings: self.include_strings.unwrap_or(include_strings),
                include_collections: self.include_collections.unwrap_or(include_collections),
                include_large_objects: self.include_large_objects.unwrap_or(include_large_objects),
                retention: self.retention_with_overrides(retention)?,
            },
        };
        Ok(kernel)
    }

    fn retention_with_overrides(&self, retention: RetentionPolicy) -> Result<RetentionPolicy> {
        Ok(RetentionPolicy::new(
            override_usize("retention ceiling", self.max_retained, retention.max_retained)?,
            override_usize("discard batch", self.discard_batch, retention.discard_batch)?,
        ))
    }
}

fn non_negative(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        StressOrbError::ConfigError(format!("{} must not be negative, got {}", what, value))
    })
}

fn override_u64(what: &str, value: Option<i64>, default: u64) -> Result<u64> {
    value.map_or(Ok(default), |v| non_negative(what, v))
}

fn override_u32(what: &str, value: Option<i64>, default: u32) -> Result<u32> {
    let value = override_u64(what, value, default as u64)?;
    u32::try_from(value)
        .map_err(|_| StressOrbError::ConfigError(format!("{} is too large: {}", what, value)))
}

fn override_usize(what: &str, value: Option<i64>, default: usize) -> Result<usize> {
    let value = override_u64(what, value, default as u64)?;
    usize::try_from(value)
        .map_err(|_| StressOrbError::ConfigError(format!("{} is too large: {}", what, value)))
}
