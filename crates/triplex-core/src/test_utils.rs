//! Test and benchmark utilities

use crate::arena::GrowableArena;
use crate::error::{StoreError, StoreResult};
use crate::memory_budget::MemoryBudget;
use crate::triple_list::TripleRecordStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use triplex_types::{INVALID_TUPLE_INDEX, ResourceComponent, ResourceId, TupleIndex, TupleStatus};

/// A simple timer to measure elapsed time.
pub struct Timer {
    start_time: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Operations per second for `operations` completed since the timer started
    pub fn throughput(&self, operations: usize) -> f64 {
        operations as f64 / self.elapsed().as_secs_f64().max(f64::EPSILON)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena-backed record store with a fixed capacity.
///
/// Tuple indexes are handed out from 1 upward; zero stays invalid.
pub struct MemoryTripleList {
    resource_ids: GrowableArena<AtomicU64>,
    links: GrowableArena<AtomicU64>,
    statuses: GrowableArena<AtomicU32>,
    next_free: AtomicU64,
}

impl MemoryTripleList {
    pub fn new(budget: Arc<MemoryBudget>, capacity: usize) -> StoreResult<Self> {
        let slots = capacity + 1;
        let mut resource_ids = GrowableArena::new(budget.clone(), 0);
        let mut links = GrowableArena::new(budget.clone(), 0);
        let mut statuses = GrowableArena::new(budget, 0);
        if !(resource_ids.reserve(slots * 3) && links.reserve(slots * 3) && statuses.reserve(slots)) {
            return Err(StoreError::capacity(
                "MemoryTripleList",
                format!("Cannot reserve room for {capacity} triples"),
            ));
        }
        Ok(Self { resource_ids, links, statuses, next_free: AtomicU64::new(1) })
    }

    /// Append a triple and return its tuple index, or `INVALID_TUPLE_INDEX` when full
    pub fn append(&self, triple: [ResourceId; 3], status: TupleStatus) -> TupleIndex {
        let tuple_index = self.next_free.fetch_add(1, Ordering::AcqRel);
        let slot = tuple_index as usize;
        if !(self.resource_ids.ensure_end_at_least(slot * 3, 3)
            && self.links.ensure_end_at_least(slot * 3, 3)
            && self.statuses.ensure_end_at_least(slot, 1))
        {
            return INVALID_TUPLE_INDEX;
        }
        for (offset, value) in triple.iter().enumerate() {
            self.resource_ids[slot * 3 + offset].store(*value, Ordering::Relaxed);
        }
        self.statuses[slot].store(u32::from(status), Ordering::Release);
        tuple_index
    }

    pub fn set_triple_status(&self, tuple_index: TupleIndex, status: TupleStatus) {
        self.statuses[tuple_index as usize].store(u32::from(status), Ordering::Release);
    }

    /// Number of triples appended so far
    pub fn len(&self) -> usize {
        (self.next_free.load(Ordering::Acquire) - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn link(&self, tuple_index: TupleIndex, component: ResourceComponent) -> &AtomicU64 {
        &self.links[tuple_index as usize * 3 + component.position()]
    }
}

impl TripleRecordStore for MemoryTripleList {
    fn resource_ids(&self, tuple_index: TupleIndex) -> [ResourceId; 3] {
        let base = tuple_index as usize * 3;
        // Pairs with the release store of the status in `append`
        let _ = self.statuses[tuple_index as usize].load(Ordering::Acquire);
        [
            self.resource_ids[base].load(Ordering::Relaxed),
            self.resource_ids[base + 1].load(Ordering::Relaxed),
            self.resource_ids[base + 2].load(Ordering::Relaxed),
        ]
    }

    fn next(&self, tuple_index: TupleIndex, component: ResourceComponent) -> TupleIndex {
        self.link(tuple_index, component).load(Ordering::Acquire)
    }

    fn set_next(&self, tuple_index: TupleIndex, component: ResourceComponent, next: TupleIndex) {
        self.link(tuple_index, component).store(next, Ordering::Release);
    }

    fn set_next_conditional(
        &self,
        tuple_index: TupleIndex,
        component: ResourceComponent,
        expected: TupleIndex,
        next: TupleIndex,
    ) -> bool {
        self.link(tuple_index, component)
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn triple_status(&self, tuple_index: TupleIndex) -> TupleStatus {
        self.statuses.get(tuple_index as usize).map_or(0, |status| status.load(Ordering::Acquire) as TupleStatus)
    }

    fn exact_triple_count(&self, mask: TupleStatus, value: TupleStatus) -> usize {
        (1..self.next_free.load(Ordering::Acquire))
            .filter(|&tuple_index| self.triple_status(tuple_index) & mask == value)
            .count()
    }

    fn first_free_tuple_index(&self) -> TupleIndex {
        self.next_free.load(Ordering::Acquire)
    }
}
