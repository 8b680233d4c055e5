//! Data models module
//!
//! Contains worker results, failure records, run reports and system
//! information.

pub mod result;

// Re-export commonly used types
pub use result::{FailureKind, RunReport, SystemInfo, WorkerFailure, WorkerResult};
