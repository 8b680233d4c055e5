//! Telemetry snapshot module
//!
//! Point-in-time captures of reclamation counters and heap occupancy, and
//! the delta between two captures.
//!
//! A snapshot reads every collector back to back and then the heap figures,
//! but nothing stops other threads from allocating in between. Treat each
//! snapshot as approximately consistent, and expect concurrent runs in the
//! same process to bleed into each other's deltas. The capturing thread's own
//! allocations are kept out of the counters, so two captures in a row on a
//! quiet process yield an all-zero delta.

pub mod alloc;
pub mod process;

use crate::models::result::duration_ms;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub use process::ProcessIntrospector;

/// Metric names reported in `unavailable` lists
pub const METRIC_COLLECTORS: &str = "collectors";
pub const METRIC_HEAP_USED: &str = "heap_used";
pub const METRIC_HEAP_COMMITTED: &str = "heap_committed";
pub const METRIC_HEAP_MAX: &str = "heap_max";
pub const METRIC_HEAP_PEAK: &str = "heap_peak";
pub const METRIC_ALLOCATIONS: &str = "allocations";

/// Cumulative counters of one reclamation collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorReading {
    pub name: String,
    pub collection_count: u64,
    /// Cumulative pause time, `None` when the collector does not measure it
    pub pause_time_ms: Option<u64>,
}

/// Heap occupancy figures; `None` marks a figure that could not be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapReading {
    pub used_bytes: Option<u64>,
    pub committed_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    /// High-water mark of `used_bytes` since the process started
    pub peak_used_bytes: Option<u64>,
}

/// Runtime introspection interface consumed by snapshots and the orchestrator
pub trait RuntimeIntrospector: Send + Sync {
    /// Cumulative counters of every collector
    fn collectors(&self) -> Result<Vec<CollectorReading>>;

    /// Current heap occupancy
    fn heap(&self) -> HeapReading;

    /// Cumulative allocation requests, when the runtime counts them
    fn allocation_count(&self) -> Option<u64> {
        None
    }

    fn logical_cpus(&self) -> usize;
}

/// Collector and heap counters at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub collection_counts: BTreeMap<String, u64>,
    /// Collectors that do not measure pauses are absent
    pub collection_pause_ms: BTreeMap<String, u64>,
    pub heap_used_bytes: Option<u64>,
    pub heap_committed_bytes: Option<u64>,
    pub heap_max_bytes: Option<u64>,
    #[serde(default)]
    pub heap_peak_bytes: Option<u64>,
    #[serde(default)]
    pub allocation_count: Option<u64>,
    pub taken_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<String>,
}

impl TelemetrySnapshot {
    /// Read all counters from `introspector`
    pub fn capture(introspector: &dyn RuntimeIntrospector) -> Self {
        let _untracked = alloc::untracked();
        let collectors = introspector.collectors();
        let heap = introspector.heap();
        let allocation_count = introspector.allocation_count();
        let taken_at = Utc::now();

        let mut snapshot = Self {
            collection_counts: BTreeMap::new(),
            collection_pause_ms: BTreeMap::new(),
            heap_used_bytes: heap.used_bytes,
            heap_committed_bytes: heap.committed_bytes,
            heap_max_bytes: heap.max_bytes,
            heap_peak_bytes: heap.peak_used_bytes,
            allocation_count,
            taken_at,
            unavailable: Vec::new(),
        };

        match collectors {
            Ok(readings) => {
                for reading in readings {
                    if let Some(pause) = reading.pause_time_ms {
                        snapshot.collection_pause_ms.insert(reading.name.clone(), pause);
                    }
                    snapshot
                        .collection_counts
                        .insert(reading.name, reading.collection_count);
                }
            }
            Err(err) => {
                debug!("Collector counters unavailable: {}", err);
                snapshot.unavailable.push(METRIC_COLLECTORS.to_string());
            }
        }

        for (name, value) in [
            (METRIC_HEAP_USED, heap.used_bytes),
            (METRIC_HEAP_COMMITTED, heap.committed_bytes),
            (METRIC_HEAP_MAX, heap.max_bytes),
            (METRIC_HEAP_PEAK, heap.peak_used_bytes),
            (METRIC_ALLOCATIONS, allocation_count),
        ] {
            if value.is_none() {
                snapshot.unavailable.push(name.to_string());
            }
        }

        snapshot
    }

    /// Activity between `self` and a later snapshot
    pub fn delta_to(&self, after: &TelemetrySnapshot) -> TelemetryDelta {
        TelemetryDelta::between(self, after)
    }

    pub fn is_available(&self, metric: &str) -> bool {
        !self.unavailable.iter().any(|m| m == metric)
    }
}

/// Collector activity and heap movement attributable to a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDelta {
    /// Per-collector cycles, never negative
    pub collection_counts: BTreeMap<String, u64>,
    pub collection_pause_ms: BTreeMap<String, u64>,
    pub heap_used_before: Option<u64>,
    pub heap_used_after: Option<u64>,
    /// Heap occupancy is a gauge, so this may be negative
    pub heap_used_change: Option<i64>,
    pub heap_committed_before: Option<u64>,
    pub heap_committed_after: Option<u64>,
    pub heap_committed_change: Option<i64>,
    pub heap_max_bytes: Option<u64>,
    /// Process high-water mark of heap occupancy when the run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_peak_bytes: Option<u64>,
    /// Allocation requests made during the interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocations: Option<u64>,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Collectors whose counters went backwards and were clamped to zero
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counter_resets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<String>,
}

impl TelemetryDelta {
    pub fn between(before: &TelemetrySnapshot, after: &TelemetrySnapshot) -> Self {
        let mut counter_resets = Vec::new();

        let collection_counts =
            counter_deltas(&before.collection_counts, &after.collection_counts, &mut counter_resets);
        let collection_pause_ms = counter_deltas(
            &before.collection_pause_ms,
            &after.collection_pause_ms,
            &mut counter_resets,
        );
        let allocations = match (before.allocation_count, after.allocation_count) {
            (Some(then), Some(now)) => {
                if now < then {
                    counter_resets.push(METRIC_ALLOCATIONS.to_string());
                }
                Some(now.saturating_sub(then))
            }
            _ => None,
        };
        counter_resets.sort();
        counter_resets.dedup();

        let mut unavailable: Vec<String> = before
            .unavailable
            .iter()
            .chain(&after.unavailable)
            .cloned()
            .collect();
        unavailable.sort();
        unavailable.dedup();

        let interval = (after.taken_at - before.taken_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        Self {
            collection_counts,
            collection_pause_ms,
            heap_used_before: before.heap_used_bytes,
            heap_used_after: after.heap_used_bytes,
            heap_used_change: signed_change(before.heap_used_bytes, after.heap_used_bytes),
            heap_committed_before: before.heap_committed_bytes,
            heap_committed_after: after.heap_committed_bytes,
            heap_committed_change: signed_change(
                before.heap_committed_bytes,
                after.heap_committed_bytes,
            ),
            heap_max_bytes: after.heap_max_bytes.or(before.heap_max_bytes),
            heap_peak_bytes: after.heap_peak_bytes.or(before.heap_peak_bytes),
            allocations,
            interval,
            counter_resets,
            unavailable,
        }
    }

    /// Total collector cycles across all collectors
    pub fn total_collections(&self) -> u64 {
        self.collection_counts.values().sum()
    }

    pub fn total_pause_ms(&self) -> u64 {
        self.collection_pause_ms.values().sum()
    }

    /// True when nothing was allocated or collected and occupancy did not move
    pub fn is_quiescent(&self) -> bool {
        self.total_collections() == 0
            && self.total_pause_ms() == 0
            && self.allocations.unwrap_or(0) == 0
            && self.heap_used_change.unwrap_or(0) == 0
    }
}

// Collectors missing from `before` count from zero; ones missing from `after` are dropped.
fn counter_deltas(
    before: &BTreeMap<String, u64>,
    after: &BTreeMap<String, u64>,
    resets: &mut Vec<String>,
) -> BTreeMap<String, u64> {
    after
        .iter()
        .map(|(name, &now)| {
            let then = before.get(name).copied().unwrap_or(0);
            if now < then {
                resets.push(name.clone());
            }
            (name.clone(), now.saturating_sub(then))
        })
        .collect()
}

fn signed_change(before: Option<u64>, after: Option<u64>) -> Option<i64> {
    let change = after? as i128 - before? as i128;
    Some(change.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
}

/// Capture a snapshot of the current process
pub fn capture_telemetry_snapshot() -> TelemetrySnapshot {
    TelemetrySnapshot::capture(&ProcessIntrospector::new())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::StressOrbError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counters one scripted snapshot reports
    #[derive(Debug, Clone)]
    pub struct Frame {
        pub collectors: Option<Vec<CollectorReading>>,
        pub heap: HeapReading,
        pub allocations: Option<u64>,
    }

    impl Frame {
        pub fn new(collectors: &[(&str, u64, Option<u64>)], used: u64) -> Self {
            Self {
                collectors: Some(
                    collectors
                        .iter()
                        .map(|(name, count, pause)| CollectorReading {
                            name: name.to_string(),
                            collection_count: *count,
                            pause_time_ms: *pause,
                        })
                        .collect(),
                ),
                heap: HeapReading {
                    used_bytes: Some(used),
                    committed_bytes: Some(used * 2),
                    max_bytes: Some(1 << 30),
                    peak_used_bytes: Some(used),
                },
                allocations: Some(0),
            }
        }

        /// Same frame with a cumulative allocation count
        pub fn with_allocations(mut self, allocations: u64) -> Self {
            self.allocations = Some(allocations);
            self
        }

        pub fn unavailable() -> Self {
            Self {
                collectors: None,
                heap: HeapReading::default(),
                allocations: None,
            }
        }
    }

    /// Introspector that replays frames in order, repeating the last one
    pub struct ScriptedIntrospector {
        frames: Mutex<Vec<Frame>>,
        captures: AtomicUsize,
    }

    impl ScriptedIntrospector {
        pub fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames: Mutex::new(frames),
                captures: AtomicUsize::new(0),
            }
        }

        /// Number of snapshots taken so far
        pub fn captures(&self) -> usize {
            self.captures.load(Ordering::SeqCst)
        }

        fn current(&self) -> Frame {
            let frames = self.frames.lock().unwrap();
            let index = self.captures().saturating_sub(1).min(frames.len() - 1);
            frames[index].clone()
        }
    }

    impl RuntimeIntrospector for ScriptedIntrospector {
        fn collectors(&self) -> Result<Vec<CollectorReading>> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            self.current().collectors.ok_or_else(|| {
                StressOrbError::TelemetryUnavailable("scripted outage".to_string())
            })
        }

        fn heap(&self) -> HeapReading {
            self.current().heap
        }

        fn allocation_count(&self) -> Option<u64> {
            self.current().allocations
        }

        fn logical_cpus(&self) -> usize {
            4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Frame, ScriptedIntrospector};
    use super::*;

    fn capture_pair(first: Frame, second: Frame) -> (TelemetrySnapshot, TelemetrySnapshot) {
        let introspector = ScriptedIntrospector::new(vec![first, second]);
        let before = TelemetrySnapshot::capture(&introspector);
        let after = TelemetrySnapshot::capture(&introspector);
        assert_eq!(introspector.captures(), 2);
        (before, after)
    }

    #[test]
    fn test_delta_counts_collector_activity() {
        let (before, after) = capture_pair(
            Frame::new(&[("young", 10, Some(40)), ("old", 2, Some(100))], 1000),
            Frame::new(&[("young", 15, Some(55)), ("old", 3, Some(180))], 1500),
        );

        let delta = before.delta_to(&after);
        assert_eq!(delta.collection_counts["young"], 5);
        assert_eq!(delta.collection_counts["old"], 1);
        assert_eq!(delta.collection_pause_ms["old"], 80);
        assert_eq!(delta.total_collections(), 6);
        assert_eq!(delta.heap_used_change, Some(500));
        assert_eq!(delta.heap_committed_change, Some(1000));
        assert_eq!(delta.heap_peak_bytes, Some(1500));
        assert!(delta.counter_resets.is_empty());
        assert!(!delta.is_quiescent());
    }

    #[test]
    fn test_delta_counts_allocations() {
        let (before, after) = capture_pair(
            Frame::new(&[("young", 1, None)], 100).with_allocations(1_000),
            Frame::new(&[("young", 1, None)], 100).with_allocations(1_250),
        );
        let delta = before.delta_to(&after);
        assert_eq!(delta.allocations, Some(250));
        assert!(!delta.is_quiescent());

        let (before, after) = capture_pair(
            Frame::new(&[], 0).with_allocations(50),
            Frame::new(&[], 0).with_allocations(10),
        );
        let delta = before.delta_to(&after);
        assert_eq!(delta.allocations, Some(0));
        assert_eq!(delta.counter_resets, vec![METRIC_ALLOCATIONS.to_string()]);
    }

    #[test]
    fn test_counter_reset_is_clamped() {
        let (before, after) = capture_pair(
            Frame::new(&[("young", 100, Some(500))], 1000),
            Frame::new(&[("young", 3, Some(7))], 1000),
        );

        let delta = TelemetryDelta::between(&before, &after);
        assert_eq!(delta.collection_counts["young"], 0);
        assert_eq!(delta.collection_pause_ms["young"], 0);
        assert_eq!(delta.counter_resets, vec!["young".to_string()]);
    }

    #[test]
    fn test_back_to_back_snapshots_are_quiescent() {
        let frame = Frame::new(&[("young", 42, Some(9)), ("old", 1, None)], 4096);
        let (before, after) = capture_pair(frame.clone(), frame);

        let delta = before.delta_to(&after);
        assert!(delta.is_quiescent());
        assert!(delta.collection_counts.values().all(|c| *c == 0));
        assert_eq!(delta.heap_used_change, Some(0));
        // collector without pause data stays out of the pause map
        assert!(!delta.collection_pause_ms.contains_key("old"));
    }

    #[test]
    fn test_new_collector_counts_from_zero() {
        let (before, after) = capture_pair(
            Frame::new(&[("young", 5, None), ("retired", 9, None)], 0),
            Frame::new(&[("young", 6, None), ("fresh", 2, None)], 0),
        );

        let delta = before.delta_to(&after);
        assert_eq!(delta.collection_counts["fresh"], 2);
        assert_eq!(delta.collection_counts["young"], 1);
        assert!(!delta.collection_counts.contains_key("retired"));
    }

    #[test]
    fn test_unavailable_metrics_are_marked() {
        let (before, after) = capture_pair(
            Frame::unavailable(),
            Frame::new(&[("young", 1, None)], 10),
        );

        assert!(!before.is_available(METRIC_COLLECTORS));
        assert!(!before.is_available(METRIC_HEAP_USED));
        assert!(after.is_available(METRIC_COLLECTORS));

        let delta = before.delta_to(&after);
        assert!(delta.unavailable.contains(&METRIC_COLLECTORS.to_string()));
        assert!(delta.unavailable.contains(&METRIC_HEAP_MAX.to_string()));
        assert!(delta.unavailable.contains(&METRIC_ALLOCATIONS.to_string()));
        assert_eq!(delta.heap_used_change, None);
        assert_eq!(delta.allocations, None);
        assert_eq!(delta.heap_max_bytes, Some(1 << 30));
    }

    #[test]
    fn test_heap_shrink_is_negative() {
        let (before, after) = capture_pair(
            Frame::new(&[("young", 1, None)], 10_000),
            Frame::new(&[("young", 2, None)], 2_500),
        );
        let delta = before.delta_to(&after);
        assert_eq!(delta.heap_used_change, Some(-7_500));
        assert_eq!(delta.heap_used_before, Some(10_000));
        assert_eq!(delta.heap_used_after, Some(2_500));
    }

    #[test]
    fn test_signed_change_saturates() {
        assert_eq!(signed_change(Some(0), Some(u64::MAX)), Some(i64::MAX));
        assert_eq!(signed_change(None, Some(1)), None);
    }

    #[test]
    fn test_process_snapshot_serializes() {
        let snapshot = capture_telemetry_snapshot();
        let json = serde_json::to_value(&snapshot).expect("Failed to serialize snapshot");
        assert!(json.get("taken_at").is_some());
        assert!(json.get("collection_counts").is_some());
    }
}
