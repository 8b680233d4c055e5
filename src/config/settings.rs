//! Harness settings persistence
//!
//! Caller-side defaults applied to run requests: worker count, duration,
//! join grace, log filter and per-kernel parameters. Stored as TOML in the
//! user's config directory.

use super::{validate_kernel, KernelName, MAX_DURATION};
use crate::bench::kernels::{RetentionPolicy, WorkloadKernel};
use crate::util::units::humantime_serde;
use crate::{Result, StressOrbError, APP_NAME, CONFIG_FILE, MAX_CONCURRENCY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default parameters for every kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelDefaults {
    pub math_iterations: u32,
    pub prime_candidates: u32,
    pub prime_range_start: u64,
    pub prime_range_end: u64,
    pub fibonacci_n: u32,
    pub matrix_size: usize,
    pub chunk_bytes: usize,
    pub chunks_per_invocation: u32,
    pub mixed_rounds: u32,
    pub mixed_array_len: usize,
    pub mixed_include_strings: bool,
    pub mixed_include_collections: bool,
    pub mixed_include_large_objects: bool,
    pub byte_retention: RetentionPolicy,
    pub mixed_retention: RetentionPolicy,
}

impl Default for KernelDefaults {
    fn default() -> Self {
        Self {
            math_iterations: 10_000,
            prime_candidates: 1,
            prime_range_start: 1_000_000,
            prime_range_end: 2_000_000,
            fibonacci_n: 2000,
            matrix_size: 50,
            chunk_bytes: 64 * 1024, // 64 KiB
            chunks_per_invocation: 100,
            mixed_rounds: 1000,
            mixed_array_len: 1000,
            mixed_include_strings: true,
            mixed_include_collections: true,
            mixed_include_large_objects: true,
            byte_retention: RetentionPolicy::new(1000, 500),
            mixed_retention: RetentionPolicy::new(1000, 100),
        }
    }
}

impl KernelDefaults {
    /// Build the kernel `name` from these defaults
    pub fn kernel(&self, name: KernelName) -> WorkloadKernel {
        match name {
            KernelName::Math => WorkloadKernel::MathCompute {
                iterations: self.math_iterations,
            },
            KernelName::Prime => WorkloadKernel::PrimeCheck {
                candidates: self.prime_candidates,
                range_start: self.prime_range_start,
                range_end: self.prime_range_end,
            },
            KernelName::Fibonacci => WorkloadKernel::Fibonacci { n: self.fibonacci_n },
            KernelName::Matrix => WorkloadKernel::MatrixMultiply {
                size: self.matrix_size,
            },
            KernelName::Bytes => WorkloadKernel::ByteAllocation {
                chunk_bytes: self.chunk_bytes,
                chunks_per_invocation: self.chunks_per_invocation,
                retention: self.byte_retention,
            },
            KernelName::Mixed => WorkloadKernel::MixedAllocationPattern {
                rounds: self.mixed_rounds,
                array_len: self.mixed_array_len,
                include_strings: self.mixed_include_strings,
                include_collections: self.mixed_include_collections,
                include_large_objects: self.mixed_include_large_objects,
                retention: self.mixed_retention,
            },
        }
    }
}

/// Defaults the caller applies when a request leaves values unspecified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub default_workers: usize,
    #[serde(with = "humantime_serde")]
    pub default_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub join_grace: Duration,
    /// `tracing` filter directive used when none is given on the command line
    pub log_filter: String,
    pub kernels: KernelDefaults,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            default_workers: 10,
            default_duration: Duration::from_secs(10),
            join_grace: super::DEFAULT_JOIN_GRACE,
            log_filter: "info".to_string(),
            kernels: KernelDefaults::default(),
        }
    }
}

impl HarnessSettings {
    /// Validate the settings values
    pub fn validate(&self) -> Result<()> {
        if self.default_workers == 0 || self.default_workers > MAX_CONCURRENCY {
            return Err(StressOrbError::ConfigError(format!(
                "Default worker count must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.default_workers
            )));
        }

        for (what, duration) in [
            ("Default duration", self.default_duration),
            ("Join grace", self.join_grace),
        ] {
            if duration > MAX_DURATION {
                return Err(StressOrbError::ConfigError(format!(
                    "{} too long: {}s (max: {}s)",
                    what,
                    duration.as_secs(),
                    MAX_DURATION.as_secs()
                )));
            }
        }

        if self.log_filter.trim().is_empty() {
            return Err(StressOrbError::ConfigError(
                "Log filter must not be empty".to_string(),
            ));
        }

        for name in KernelName::all() {
            validate_kernel(&self.kernels.kernel(name))?;
        }

        Ok(())
    }

    /// Load settings from the standard location.
    /// Returns defaults if the file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            StressOrbError::SettingsError(format!(
                "Failed to read settings file {}: {}",
                path.display(),
                e
            ))
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| {
            StressOrbError::SettingsError(format!(
                "Failed to parse settings file {}: {}",
                path.display(),
                e
            ))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to the standard location
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_file_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StressOrbError::SettingsError(format!(
                    "Failed to create settings directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            StressOrbError::SettingsError(format!(
                "Failed to write settings file {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Get the standard settings file path
    /// Uses $CONFIG_HOME/stressorb/stressorb.toml
    pub fn config_file_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            StressOrbError::SettingsError("Unable to determine config directory".to_string())
        })?;

        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}
