//! Process memory observation and cache eviction
//!
//! The monitor is a pure observer: it owns neither the volumes nor their
//! caches, it only asks a lazily-decoded volume to drop its decode cache when
//! headroom under the configured ceiling runs low. The builder re-arms it at
//! each plane boundary, so eviction happens at most once per plane.

use crate::volume::{PixelVolume, VolumeScalar};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};

/// Returns current process memory usage in bytes
pub type UsageProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Resident set size of the current process, read from the `VmRSS` line of
/// `/proc/self/status` (reported in kB, independent of page size).
/// Returns 0 where procfs is unavailable, which disables eviction.
pub fn resident_set_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Watches memory headroom between units of work and evicts a lazily-decoded
/// source's pixel cache when less than half the ceiling remains.
pub struct CacheEvictionMonitor {
    ceiling_bytes: u64,
    probe: UsageProbe,
    armed: AtomicBool,
}

impl CacheEvictionMonitor {
    /// Monitor against `ceiling_bytes` using the process resident-set probe
    pub fn new(ceiling_bytes: u64) -> Self {
        Self::with_probe(ceiling_bytes, Box::new(resident_set_bytes))
    }

    /// Monitor with a custom usage probe (tests, embedders with their own accounting)
    pub fn with_probe(ceiling_bytes: u64, probe: UsageProbe) -> Self {
        Self {
            ceiling_bytes,
            probe,
            armed: AtomicBool::new(true),
        }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Re-arm the monitor for the next plane of work
    pub fn begin_plane(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Check headroom and evict the volume's cache if memory is low.
    /// Returns true when a cache was cleared. Disarms until the next
    /// [`begin_plane`](Self::begin_plane), whatever the outcome.
    pub fn maybe_evict<T: VolumeScalar>(&self, volume: &dyn PixelVolume<T>) -> bool {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        let used = (self.probe)();
        let headroom = self.ceiling_bytes.saturating_sub(used);
        if headroom < self.ceiling_bytes / 2 {
            if let Some(cache) = volume.cache() {
                debug!(
                    "memory headroom {} below half of ceiling {}, evicting decode cache",
                    headroom, self.ceiling_bytes
                );
                cache.clear();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{InMemoryVolume, LazyVolume};
    use ndarray::Array2;
    use std::sync::Arc;

    fn lazy_volume() -> Arc<LazyVolume<u8>> {
        Arc::new(LazyVolume::new([4, 4, 4], |_z| Array2::zeros((4, 4))))
    }

    #[test]
    fn test_evicts_under_pressure() {
        let vol = lazy_volume();
        vol.read_region([0, 0, 0], [4, 4, 4]).unwrap();
        assert_eq!(vol.cached_planes(), 4);

        let monitor = CacheEvictionMonitor::with_probe(1024, Box::new(|| 1024));
        assert!(monitor.maybe_evict(vol.as_ref()));
        assert_eq!(vol.cached_planes(), 0);
        assert_eq!(vol.clear_count(), 1);
    }

    #[test]
    fn test_no_eviction_with_headroom() {
        let vol = lazy_volume();
        vol.read_region([0, 0, 0], [4, 4, 1]).unwrap();

        let monitor = CacheEvictionMonitor::with_probe(1024, Box::new(|| 0));
        assert!(!monitor.maybe_evict(vol.as_ref()));
        assert_eq!(vol.cached_planes(), 1);
    }

    #[test]
    fn test_at_most_once_per_plane() {
        let vol = lazy_volume();
        let monitor = CacheEvictionMonitor::with_probe(1024, Box::new(|| 1024));

        vol.read_region([0, 0, 0], [4, 4, 1]).unwrap();
        assert!(monitor.maybe_evict(vol.as_ref()));

        // disarmed until the next plane, even under continued pressure
        vol.read_region([0, 0, 0], [4, 4, 1]).unwrap();
        assert!(!monitor.maybe_evict(vol.as_ref()));
        assert_eq!(vol.clear_count(), 1);

        monitor.begin_plane();
        assert!(monitor.maybe_evict(vol.as_ref()));
        assert_eq!(vol.clear_count(), 2);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_resident_probe_reports_usage() {
        // a running process always has resident pages
        assert!(resident_set_bytes() > 0);
    }

    #[test]
    fn test_resident_volume_is_never_evicted() {
        let vol: InMemoryVolume<u8> = InMemoryVolume::constant([4, 4, 4], 0);
        let monitor = CacheEvictionMonitor::with_probe(1024, Box::new(|| 1024));
        assert!(!monitor.maybe_evict(&vol));
    }
}
