use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::time::Duration;
use stressorb::config::HarnessSettings;
use stressorb::models::{RunReport, SystemInfo};
use stressorb::telemetry::alloc::TrackingAllocator;
use stressorb::telemetry::TelemetrySnapshot;
use stressorb::util::units::{format_bytes, format_duration, format_rate};
use stressorb::util::init_tracing;
use stressorb::{capture_telemetry_snapshot, error, Orchestrator, Result};

mod cli;

use cli::{Cli, Commands, ConfigAction, RunArgs};

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", error::user_friendly_message(&err));
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.log_level.as_deref(), &settings.log_filter);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let outcome = runtime.block_on(execute(cli, settings));
    // abandoned workers must not hold the process open after the report
    runtime.shutdown_background();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", error::user_friendly_message(&err));
            if error::is_rejection(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn load_settings(cli: &Cli) -> Result<HarnessSettings> {
    match &cli.config {
        Some(path) => HarnessSettings::load_from(path),
        None => HarnessSettings::load(),
    }
}

async fn execute(cli: Cli, settings: HarnessSettings) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run(args, &settings).await,
        Commands::Snapshot { json } => {
            let snapshot = capture_telemetry_snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
            Ok(())
        }
        Commands::Inspect { json } => {
            let info = SystemInfo::detect();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_system_info(&info);
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&settings)?);
                Ok(())
            }
            ConfigAction::Save => {
                let path = match &cli.config {
                    Some(path) => {
                        settings.save_to(path)?;
                        path.clone()
                    }
                    None => settings.save()?,
                };
                println!("Saved settings to {}", path.display());
                Ok(())
            }
        },
    }
}

async fn run(args: RunArgs, settings: &HarnessSettings) -> Result<()> {
    let config = args.to_request().into_config(settings)?;

    let spinner = (!args.json).then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!(
            "{} on {} workers for {}",
            config.kernel.description(),
            config.concurrency,
            format_duration(config.duration_per_worker)
        ));
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    });

    let report = Orchestrator::new().run(config).await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let report = report?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", report.summary());
    println!(
        "Wall time: {}  Logical CPUs: {}",
        format_duration(report.actual_wall_duration),
        report.logical_cpus
    );

    println!("\nWorkers:");
    for result in &report.worker_results {
        println!(
            "  #{:<3} {:>10} ops  {:>14}  {:>10}  {} allocated, {} retained",
            result.worker_id,
            result.operations,
            format_rate(result.operations_per_second),
            format_duration(result.elapsed),
            format_bytes(result.bytes_allocated),
            result.retained_items
        );
    }
    for failure in &report.failures {
        println!("  #{:<3} {:?}: {}", failure.worker_id, failure.kind, failure.message);
    }

    let delta = &report.telemetry_delta;
    println!("\nTelemetry:");
    for (name, count) in &delta.collection_counts {
        match delta.collection_pause_ms.get(name) {
            Some(pause) => println!("  {:<14} {} collections, {} ms", name, count, pause),
            None => println!("  {:<14} {} collections", name, count),
        }
    }
    if let (Some(before), Some(after)) = (delta.heap_used_before, delta.heap_used_after) {
        println!(
            "  heap used      {} -> {}",
            format_bytes(before),
            format_bytes(after)
        );
    }
    if let Some(peak) = delta.heap_peak_bytes {
        println!("  heap peak      {}", format_bytes(peak));
    }
    if let Some(allocations) = delta.allocations {
        match report.allocations_per_second {
            Some(rate) => println!("  allocations    {} ({:.0}/s)", allocations, rate),
            None => println!("  allocations    {}", allocations),
        }
    }
    if let Some(committed) = delta.heap_committed_after {
        println!("  resident       {}", format_bytes(committed));
    }
    if let Some(max) = delta.heap_max_bytes {
        println!("  memory limit   {}", format_bytes(max));
    }
    if let Some(percent) = report.heap_usage_percent {
        println!("  heap of limit  {:.1}%", percent);
    }
    if let Some(percent) = report.resident_vs_limit_percent {
        println!("  resident/limit {:.1}%", percent);
    }
    if !delta.counter_resets.is_empty() {
        println!("  counter resets: {}", delta.counter_resets.join(", "));
    }
    if !delta.unavailable.is_empty() {
        println!("  unavailable: {}", delta.unavailable.join(", "));
    }
}

fn print_snapshot(snapshot: &TelemetrySnapshot) {
    println!("Snapshot at {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    for (name, count) in &snapshot.collection_counts {
        println!("  {:<14} {} collections", name, count);
    }
    let show = |label: &str, value: Option<u64>| match value {
        Some(bytes) => println!("  {:<14} {}", label, format_bytes(bytes)),
        None => println!("  {:<14} unavailable", label),
    };
    show("heap used", snapshot.heap_used_bytes);
    show("committed", snapshot.heap_committed_bytes);
    show("max", snapshot.heap_max_bytes);
}

fn print_system_info(info: &SystemInfo) {
    let show = |value: Option<u64>| value.map(format_bytes).unwrap_or_else(|| "unknown".to_string());
    println!("OS:                 {}", info.os);
    println!("Logical CPUs:       {}", info.logical_cpus);
    println!("Memory total:       {}", show(info.memory_total));
    println!("Memory available:   {}", show(info.memory_available));
    println!("Container limit:    {}", show(info.container_memory_limit));
    println!("Process resident:   {}", show(info.process_resident));
    println!("Allocation tracking: {}", if info.allocation_tracking { "on" } else { "off" });
}
