//! Kept alone in its own binary: any other test thread allocating between
//! the two captures would show up in the delta.

use std::hint::black_box;
use stressorb::capture_telemetry_snapshot;
use stressorb::telemetry::alloc::TrackingAllocator;
use stressorb::telemetry::{METRIC_ALLOCATIONS, METRIC_COLLECTORS, METRIC_HEAP_USED};

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator;

#[test]
fn test_back_to_back_captures_are_quiescent() {
    drop(black_box(vec![0u8; 64]));

    let before = capture_telemetry_snapshot();
    let after = capture_telemetry_snapshot();
    let delta = before.delta_to(&after);

    assert!(before.is_available(METRIC_COLLECTORS));
    assert!(before.is_available(METRIC_HEAP_USED));
    assert!(before.is_available(METRIC_ALLOCATIONS));
    assert!(
        delta.is_quiescent(),
        "counts={:?} allocations={:?} heap_used_change={:?}",
        delta.collection_counts,
        delta.allocations,
        delta.heap_used_change
    );
    assert!(delta.collection_counts.values().all(|count| *count == 0));
    assert_eq!(delta.allocations, Some(0));
    assert_eq!(delta.heap_used_change, Some(0));
    assert!(delta.counter_resets.is_empty());
}
