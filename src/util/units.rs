//! Units formatting and conversion utilities
//!
//! Provides functions for human-readable formatting of sizes, durations and
//! operation rates.

use byte_unit::{Byte, UnitType};
use std::time::Duration;

/// Format bytes into human-readable size with binary units
///
/// # Examples
/// ```
/// use stressorb::util::units::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert!(format_bytes(1048576).ends_with("MiB"));
/// ```
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.1}", adjusted)
}

/// Parse human-readable size string into bytes
///
/// Accepts decimal (KB, MB, ..) and binary (KiB, MiB, ..) units.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.starts_with('-') {
        return Err("Size cannot be negative".to_string());
    }
    Byte::parse_str(input, true)
        .map(|b| b.as_u64())
        .map_err(|e| format!("Invalid size '{}': {}", input, e))
}

/// Format duration into human-readable string
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use stressorb::util::units::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    // sub-millisecond detail is noise at the scale of a run
    let millis = Duration::from_millis(duration.as_millis() as u64);
    if millis.is_zero() {
        return format!("{}µs", duration.as_micros());
    }
    humantime::format_duration(millis).to_string()
}

/// Parse duration string into Duration
///
/// Supports formats like: "30s", "1m 30s", "1h 30m", "500ms"
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    humantime::parse_duration(input.trim())
        .map_err(|e| format!("Invalid duration '{}': {}", input.trim(), e))
}

/// Operations per second over `duration`; zero for a zero duration
pub fn calculate_ops_per_second(operations: u64, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 0.0;
    }
    operations as f64 / duration.as_secs_f64()
}

/// Format an operation rate with appropriate units
///
/// # Examples
/// ```
/// use stressorb::util::units::format_rate;
///
/// assert_eq!(format_rate(1500.0), "1.5K ops/s");
/// ```
pub fn format_rate(ops_per_second: f64) -> String {
    if ops_per_second >= 1_000_000.0 {
        format!("{:.1}M ops/s", ops_per_second / 1_000_000.0)
    } else if ops_per_second >= 1_000.0 {
        format!("{:.1}K ops/s", ops_per_second / 1_000.0)
    } else {
        format!("{:.1} ops/s", ops_per_second)
    }
}

/// Serde adapter writing durations as humantime strings ("1m 30s")
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
