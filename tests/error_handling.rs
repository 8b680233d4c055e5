use std::time::Duration;
use stressorb::bench::kernels::{KernelError, WorkloadKernel};
use stressorb::config::{HarnessSettings, KernelName, RunRequest};
use stressorb::error;
use stressorb::{run_workload, RunConfig, StressOrbError};

#[test]
fn test_negative_workers_rejected_before_run() {
    let request = RunRequest {
        workers: Some(-1),
        ..RunRequest::new(KernelName::Fibonacci)
    };
    let err = request
        .into_config(&HarnessSettings::default())
        .expect_err("negative worker count must be rejected");

    assert!(matches!(err, StressOrbError::ConfigError(_)));
    assert!(error::is_rejection(&err));
    assert!(error::user_friendly_message(&err).contains("worker count"));
}

#[tokio::test]
async fn test_zero_workers_rejected_by_run() {
    let config = RunConfig::new(0, Duration::from_secs(1), WorkloadKernel::Fibonacci { n: 10 });
    let err = run_workload(config).await.expect_err("zero workers must be rejected");
    assert!(error::is_rejection(&err));
}

#[test]
fn test_kernel_error_conversion_and_messages() {
    let err: StressOrbError = KernelError::AllocationFailed { requested: 4096 }.into();
    assert!(matches!(err, StressOrbError::WorkerResourceError(_)));
    assert!(err.to_string().contains("4096"));
    assert!(!error::is_rejection(&err));
    assert!(error::user_friendly_message(&err).contains("out of memory"));

    let timeout = StressOrbError::OrchestrationTimeout("worker 3".into());
    assert!(error::user_friendly_message(&timeout).contains("grace"));

    let io: StressOrbError = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "oom").into();
    assert!(matches!(io, StressOrbError::WorkerResourceError(_)));
}

#[test]
fn test_settings_errors_are_not_rejections() {
    let parse_err = toml::from_str::<HarnessSettings>("default_workers = [").unwrap_err();
    let err: StressOrbError = parse_err.into();
    assert!(matches!(err, StressOrbError::SettingsError(_)));
    assert!(!error::is_rejection(&err));
    assert!(error::user_friendly_message(&err).contains("settings"));
}
