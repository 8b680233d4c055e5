//! Process introspection
//!
//! The production [`RuntimeIntrospector`]: reclamation counters from the
//! tracking allocator, occupancy from the allocator and the OS, and the
//! memory ceiling from the enclosing cgroup or the host.

use super::alloc::{self, LARGE_OBJECT_COLLECTOR, SMALL_OBJECT_COLLECTOR};
use super::{CollectorReading, HeapReading, RuntimeIntrospector};
use crate::{Result, StressOrbError};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// Introspector backed by the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessIntrospector;

impl ProcessIntrospector {
    pub fn new() -> Self {
        Self
    }
}

impl RuntimeIntrospector for ProcessIntrospector {
    fn collectors(&self) -> Result<Vec<CollectorReading>> {
        if !alloc::is_active() {
            return Err(StressOrbError::TelemetryUnavailable(
                "tracking allocator is not installed".to_string(),
            ));
        }

        let counters = alloc::counters();
        Ok(vec![
            CollectorReading {
                name: SMALL_OBJECT_COLLECTOR.to_string(),
                collection_count: counters.small_frees,
                pause_time_ms: None,
            },
            CollectorReading {
                name: LARGE_OBJECT_COLLECTOR.to_string(),
                collection_count: counters.large_frees,
                pause_time_ms: Some(counters.large_free_nanos / 1_000_000),
            },
        ])
    }

    fn heap(&self) -> HeapReading {
        let counters = alloc::is_active().then(alloc::counters);
        let memory = MemoryFigures::read();
        HeapReading {
            used_bytes: counters.map(|c| c.live_bytes),
            committed_bytes: memory.process_resident,
            max_bytes: memory.ceiling(),
            peak_used_bytes: counters.map(|c| c.peak_bytes),
        }
    }

    fn allocation_count(&self) -> Option<u64> {
        alloc::is_active().then(|| alloc::counters().allocations)
    }

    fn logical_cpus(&self) -> usize {
        logical_cpus()
    }
}

/// Logical CPUs available to this process
pub fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Host and process memory as reported by the OS; `None` where unreadable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryFigures {
    pub total: Option<u64>,
    pub available: Option<u64>,
    /// Limit of the enclosing cgroup, when tighter than host memory
    pub container_limit: Option<u64>,
    /// Resident set size of this process
    pub process_resident: Option<u64>,
}

impl MemoryFigures {
    pub fn read() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let total = non_zero(system.total_memory());
        let process_resident = sysinfo::get_current_pid().ok().and_then(|pid| {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            system.process(pid).and_then(|p| non_zero(p.memory()))
        });

        Self {
            total,
            available: non_zero(system.available_memory()),
            container_limit: effective_limit(
                system.cgroup_limits().map(|limits| limits.total_memory),
                total,
            ),
            process_resident,
        }
    }

    /// Largest heap the process can grow to: the container limit, else the host
    pub fn ceiling(&self) -> Option<u64> {
        self.container_limit.or(self.total)
    }
}

// sysinfo reports zero for figures it cannot read
fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// A cgroup limit at or above host memory constrains nothing
fn effective_limit(cgroup_total: Option<u64>, host_total: Option<u64>) -> Option<u64> {
    let limit = cgroup_total.and_then(non_zero)?;
    match host_total {
        Some(host) if limit >= host => None,
        _ => Some(limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_limit() {
        let gib = 1u64 << 30;
        assert_eq!(effective_limit(Some(2 * gib), Some(16 * gib)), Some(2 * gib));
        assert_eq!(effective_limit(Some(16 * gib), Some(16 * gib)), None);
        assert_eq!(effective_limit(Some(64 * gib), Some(16 * gib)), None);
        assert_eq!(effective_limit(Some(0), Some(16 * gib)), None);
        assert_eq!(effective_limit(None, Some(16 * gib)), None);
        assert_eq!(effective_limit(Some(gib), None), Some(gib));
    }

    #[test]
    fn test_ceiling_prefers_container_limit() {
        let figures = MemoryFigures {
            total: Some(8 << 30),
            container_limit: Some(1 << 30),
            ..MemoryFigures::default()
        };
        assert_eq!(figures.ceiling(), Some(1 << 30));

        let host_only = MemoryFigures {
            container_limit: None,
            ..figures
        };
        assert_eq!(host_only.ceiling(), Some(8 << 30));
        assert_eq!(MemoryFigures::default().ceiling(), None);
    }

    #[test]
    fn test_memory_figures_on_supported_hosts() {
        let figures = MemoryFigures::read();
        if sysinfo::IS_SUPPORTED_SYSTEM {
            assert!(figures.total.is_some());
            assert!(figures.process_resident.is_some());
            assert!(figures.ceiling().is_some());
        }
        if let (Some(limit), Some(total)) = (figures.container_limit, figures.total) {
            assert!(limit < total);
        }
    }

    #[test]
    fn test_process_introspector_reports_cpus() {
        let introspector = ProcessIntrospector::new();
        assert!(introspector.logical_cpus() >= 1);
        if sysinfo::IS_SUPPORTED_SYSTEM {
            assert!(introspector.heap().max_bytes.is_some());
        }
    }

    #[test]
    fn test_allocator_metrics_unavailable_without_tracking() {
        // the unit test binary runs on the default allocator
        let introspector = ProcessIntrospector::new();
        assert!(matches!(
            introspector.collectors(),
            Err(StressOrbError::TelemetryUnavailable(_))
        ));
        assert_eq!(introspector.allocation_count(), None);
        assert_eq!(introspector.heap().used_bytes, None);
        assert_eq!(introspector.heap().peak_used_bytes, None);
    }
}
