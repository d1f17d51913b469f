//! Process-wide ceiling on committed index memory

use crate::config::StorageConfig;
use crate::statistics::ComponentStatistics;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Allocation authority shared by every arena of a store.
///
/// Arenas charge the budget before extending their committed window and return the
/// bytes when they release backing or are dropped.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
    denied: AtomicUsize,
    large_region_size: usize,
    page_size: usize,
}

impl MemoryBudget {
    pub fn new(limit: usize, large_region_size: usize, page_size: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            denied: AtomicUsize::new(0),
            large_region_size,
            page_size,
        }
    }

    /// Budget without a ceiling
    pub fn unlimited() -> Self {
        let config = StorageConfig::default();
        Self::new(usize::MAX, config.large_region_bytes, config.page_size)
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.memory_limit_bytes.unwrap_or(usize::MAX),
            config.large_region_bytes,
            config.page_size,
        )
    }

    /// Charge `bytes` against the ceiling; `false` leaves the budget unchanged
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes).filter(|&next| next <= self.limit) else {
                self.denied.fetch_add(1, Ordering::Relaxed);
                warn!(
                    requested_bytes = bytes,
                    used_bytes = current,
                    limit_bytes = self.limit,
                    "Memory budget denied allocation"
                );
                return false;
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn notify_deallocated(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Default reservation size for arenas indexed by resource identifier
    pub fn large_region_size(&self) -> usize {
        self.large_region_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let mut result = ComponentStatistics::new("MemoryBudget");
        result.add_integer_item("Used bytes", self.used_bytes() as u64);
        result.add_integer_item("Peak bytes", self.peak.load(Ordering::Relaxed) as u64);
        result.add_integer_item("Denied requests", self.denied.load(Ordering::Relaxed) as u64);
        if self.limit != usize::MAX {
            result.add_integer_item("Limit bytes", self.limit as u64);
        }
        result
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_respects_limit() {
        let budget = MemoryBudget::new(100, 1 << 20, 4096);
        assert!(budget.try_allocate(60));
        assert!(!budget.try_allocate(41));
        assert!(budget.try_allocate(40));
        assert_eq!(budget.used_bytes(), 100);

        budget.notify_deallocated(60);
        assert_eq!(budget.used_bytes(), 40);
        assert!(budget.try_allocate(60));
    }

    #[test]
    fn test_statistics_track_peak_and_denials() {
        let budget = MemoryBudget::new(10, 1 << 20, 4096);
        assert!(budget.try_allocate(8));
        budget.notify_deallocated(8);
        assert!(!budget.try_allocate(11));

        let stats = budget.component_statistics();
        assert_eq!(stats.integer_item("Peak bytes"), Some(8));
        assert_eq!(stats.integer_item("Denied requests"), Some(1));
        assert_eq!(stats.integer_item("Used bytes"), Some(0));
    }
}
