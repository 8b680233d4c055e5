//! Utility functions module
//!
//! Contains helpers for units formatting, duration parsing and tracing
//! setup.

pub mod logging;
pub mod units;

// Re-export commonly used functions
pub use logging::init_tracing;
pub use units::{
    calculate_ops_per_second, format_bytes, format_duration, format_rate, parse_bytes,
    parse_duration,
};
