//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use stressorb::config::{KernelName, RunRequest};
use stressorb::util::units::{parse_bytes, parse_duration};

#[derive(Parser)]
#[command(author, version, about = "Time-boxed CPU and allocation stress with memory telemetry", long_about = None)]
pub struct Cli {
    /// Path to the settings file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log filter (trace, debug, info, warn, error or a directive)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workload across concurrent workers
    Run(RunArgs),

    /// Capture one telemetry snapshot
    Snapshot {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show read-only system information
    Inspect {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show or persist the effective settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective settings as TOML
    Show,
    /// Write the effective settings to the settings file
    Save,
}

#[derive(Args)]
pub struct RunArgs {
    /// Kernel to run
    #[arg(long, value_enum, default_value_t = KernelName::Math)]
    pub kernel: KernelName,

    /// Number of concurrent workers
    #[arg(long, short = 'w', allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Per-worker duration (e.g. 10s, 1m 30s)
    #[arg(long, short = 'd', value_parser = parse_duration)]
    pub duration: Option<std::time::Duration>,

    /// Grace period for joining workers
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<std::time::Duration>,

    /// Base seed for deterministic worker generators
    #[arg(long)]
    pub seed: Option<u64>,

    /// Math iterations, Fibonacci n or mixed-pattern rounds
    #[arg(long, allow_negative_numbers = true)]
    pub iterations: Option<i64>,

    /// Matrix size or mixed-pattern array length
    #[arg(long, allow_negative_numbers = true)]
    pub size: Option<i64>,

    /// Prime candidates per invocation
    #[arg(long, allow_negative_numbers = true)]
    pub candidates: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub range_start: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub range_end: Option<i64>,

    /// Allocation chunk size (e.g. 64KiB, 1MiB)
    #[arg(long, value_parser = parse_bytes)]
    pub chunk_size: Option<u64>,

    /// Chunks allocated per invocation
    #[arg(long, allow_negative_numbers = true)]
    pub chunks: Option<i64>,

    /// Retained items that trigger a trim
    #[arg(long, allow_negative_numbers = true)]
    pub max_retained: Option<i64>,

    /// Oldest items discarded per trim
    #[arg(long, allow_negative_numbers = true)]
    pub discard_batch: Option<i64>,

    /// Skip string building in the mixed pattern
    #[arg(long)]
    pub no_strings: bool,

    /// Skip record collections in the mixed pattern
    #[arg(long)]
    pub no_collections: bool,

    /// Skip large buffers in the mixed pattern
    #[arg(long)]
    pub no_large_objects: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn to_request(&self) -> RunRequest {
        let millis = |d: std::time::Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        RunRequest {
            kernel: self.kernel,
            workers: self.workers,
            duration_ms: self.duration.map(millis),
            grace_ms: self.grace.map(millis),
            seed: self.seed,
            iterations: self.iterations,
            size: self.size,
            candidates: self.candidates,
            range_start: self.range_start,
            range_end: self.range_end,
            chunk_bytes: self
                .chunk_size
                .map(|b| i64::try_from(b).unwrap_or(i64::MAX)),
            chunks: self.chunks,
            max_retained: self.max_retained,
            discard_batch: self.discard_batch,
            include_strings: self.no_strings.then_some(false),
            include_collections: self.no_collections.then_some(false),
            include_large_objects: self.no_large_objects.then_some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments_map_to_request() {
        let cli = Cli::try_parse_from([
            "stressorb",
            "run",
            "--kernel",
            "bytes",
            "--workers",
            "-1",
            "--duration",
            "1m 30s",
            "--chunk-size",
            "512KiB",
            "--no-strings",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let request = args.to_request();
        assert_eq!(request.kernel, KernelName::Bytes);
        assert_eq!(request.workers, Some(-1));
        assert_eq!(request.duration_ms, Some(90_000));
        assert_eq!(request.chunk_bytes, Some(512 * 1024));
        assert_eq!(request.include_strings, Some(false));
        assert_eq!(request.include_collections, None);
    }
}
