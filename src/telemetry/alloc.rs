//! Allocation tracking
//!
//! A `GlobalAlloc` wrapper around the system allocator that keeps
//! process-wide counters. Install it in a binary with
//! `#[global_allocator]`; until it serves its first request every
//! allocator-derived metric reports as unavailable.
//!
//! A thread can hold an [`Untracked`] guard to keep its own traffic out of
//! the counters, which is how telemetry capture avoids measuring itself.
//! Memory allocated under the guard and freed after it is counted as a free
//! only; the live-byte gauge floors at zero.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Frees at or above this size count towards the `large-object` collector
pub const LARGE_BLOCK_BYTES: usize = 256 * 1024;

pub const SMALL_OBJECT_COLLECTOR: &str = "small-object";
pub const LARGE_OBJECT_COLLECTOR: &str = "large-object";

static ACTIVE: AtomicBool = AtomicBool::new(false);
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static SMALL_FREES: AtomicU64 = AtomicU64::new(0);
static LARGE_FREES: AtomicU64 = AtomicU64::new(0);
static LARGE_FREE_NANOS: AtomicU64 = AtomicU64::new(0);
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static PEAK_BYTES: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // const-initialized and drop-free, so access never allocates
    static UNTRACKED: Cell<bool> = const { Cell::new(false) };
}

/// Counting wrapper around [`System`]
pub struct TrackingAllocator;

fn tracking() -> bool {
    // a thread tearing down its locals is tracked as usual
    !UNTRACKED.try_with(Cell::get).unwrap_or(false)
}

fn add_live(bytes: u64) {
    let live = LIVE_BYTES.fetch_add(bytes, Ordering::Relaxed) + bytes;
    PEAK_BYTES.fetch_max(live, Ordering::Relaxed);
}

fn sub_live(bytes: u64) {
    let _ = LIVE_BYTES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
        Some(live.saturating_sub(bytes))
    });
}

fn record_alloc(size: usize) {
    ACTIVE.store(true, Ordering::Relaxed);
    if !tracking() {
        return;
    }
    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    ALLOCATED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    add_live(size as u64);
}

fn record_free(size: usize, took_nanos: Option<u64>) {
    if !tracking() {
        return;
    }
    sub_live(size as u64);
    match took_nanos {
        Some(nanos) => {
            LARGE_FREES.fetch_add(1, Ordering::Relaxed);
            LARGE_FREE_NANOS.fetch_add(nanos, Ordering::Relaxed);
        }
        None => {
            SMALL_FREES.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// SAFETY: every request is forwarded unchanged to `System`; the wrapper only
// touches atomics, a const thread-local and the monotonic clock, none of
// which allocates.
unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() >= LARGE_BLOCK_BYTES {
            let start = Instant::now();
            unsafe { System.dealloc(ptr, layout) };
            record_free(layout.size(), Some(start.elapsed().as_nanos() as u64));
        } else {
            unsafe { System.dealloc(ptr, layout) };
            record_free(layout.size(), None);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() && tracking() {
            let old_size = layout.size();
            if new_size >= old_size {
                let grown = (new_size - old_size) as u64;
                ALLOCATED_BYTES.fetch_add(grown, Ordering::Relaxed);
                add_live(grown);
            } else {
                sub_live((old_size - new_size) as u64);
            }
        }
        new_ptr
    }
}

/// Keeps the current thread's allocator traffic out of the counters until
/// dropped. Guards nest.
#[must_use = "traffic is tracked again as soon as the guard is dropped"]
pub struct Untracked {
    previous: bool,
}

/// Stop counting this thread's allocations and frees
pub fn untracked() -> Untracked {
    let previous = UNTRACKED.try_with(|flag| flag.replace(true)).unwrap_or(false);
    Untracked { previous }
}

impl Drop for Untracked {
    fn drop(&mut self) {
        let _ = UNTRACKED.try_with(|flag| flag.set(self.previous));
    }
}

/// Point-in-time copy of the allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorCounters {
    pub allocations: u64,
    pub allocated_bytes: u64,
    pub small_frees: u64,
    pub large_frees: u64,
    pub large_free_nanos: u64,
    pub live_bytes: u64,
    pub peak_bytes: u64,
}

/// Whether the tracking allocator has served any request in this process
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

/// Read all counters back to back.
///
/// Each load is individually atomic but the set is not: allocations on other
/// threads can land between two loads.
pub fn counters() -> AllocatorCounters {
    let live_bytes = LIVE_BYTES.load(Ordering::Relaxed);
    AllocatorCounters {
        allocations: ALLOCATIONS.load(Ordering::Relaxed),
        allocated_bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
        small_frees: SMALL_FREES.load(Ordering::Relaxed),
        large_frees: LARGE_FREES.load(Ordering::Relaxed),
        large_free_nanos: LARGE_FREE_NANOS.load(Ordering::Relaxed),
        live_bytes,
        // the peak is raised after the live gauge, so it can briefly lag
        peak_bytes: PEAK_BYTES.load(Ordering::Relaxed).max(live_bytes),
    }
}
