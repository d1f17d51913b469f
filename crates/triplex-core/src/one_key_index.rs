//! Chain heads and triple counts indexed directly by resource identifier

use crate::arena::GrowableArena;
use crate::constants::arena::ONE_KEY_INDEX_PAGE_POWER;
use crate::error::{ResultExt, StoreError, StoreResult};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{check_tag, write_tag};
use crate::statistics::ComponentStatistics;
use std::io::{Read, Write};
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::instrument;
use triplex_types::{INVALID_TUPLE_INDEX, ResourceId, TupleIndex};

const TAG: &str = "OneKeyIndex";

/// Two parallel arenas: the head of each identifier's chain and its live triple count.
///
/// Every operation except `head` and `count` expects the identifier to be covered by a
/// prior successful `extend`.
pub struct OneKeyIndex {
    heads: GrowableArena<AtomicU64>,
    counts: GrowableArena<AtomicU32>,
}

impl OneKeyIndex {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            heads: GrowableArena::new(budget.clone(), ONE_KEY_INDEX_PAGE_POWER),
            counts: GrowableArena::new(budget, ONE_KEY_INDEX_PAGE_POWER),
        }
    }

    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> bool {
        self.heads.reserve_large() && self.clear_counts()
    }

    /// Zero every count by replacing the count arena
    pub fn clear_counts(&mut self) -> bool {
        self.counts.reserve_large() && self.counts.ensure_end_at_least(self.heads.end_index(), 0)
    }

    /// Cover identifiers `[0, resource_id]` in both arenas
    pub fn extend(&self, resource_id: ResourceId) -> bool {
        let Ok(index) = usize::try_from(resource_id) else {
            return false;
        };
        self.heads.ensure_end_at_least(index, 1) && self.counts.ensure_end_at_least(index, 1)
    }

    /// First identifier not covered by the head arena
    pub fn end_index(&self) -> usize {
        self.heads.end_index()
    }

    /// Chain head, or `INVALID_TUPLE_INDEX` beyond the end
    pub fn head(&self, resource_id: ResourceId) -> TupleIndex {
        match self.heads.get(resource_id as usize) {
            Some(head) => head.load(Ordering::Acquire),
            None => INVALID_TUPLE_INDEX,
        }
    }

    pub fn set_head(&self, resource_id: ResourceId, tuple_index: TupleIndex) {
        self.heads[resource_id as usize].store(tuple_index, Ordering::Release);
    }

    pub fn set_head_conditional(
        &self,
        resource_id: ResourceId,
        expected: TupleIndex,
        tuple_index: TupleIndex,
    ) -> bool {
        self.heads[resource_id as usize]
            .compare_exchange(expected, tuple_index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Live triple count, 0 beyond the end
    pub fn count(&self, resource_id: ResourceId) -> usize {
        match self.counts.get(resource_id as usize) {
            Some(count) => count.load(Ordering::Acquire) as usize,
            None => 0,
        }
    }

    /// Add `amount` and return the new count
    pub fn increment_count(&self, resource_id: ResourceId, amount: u32) -> usize {
        let previous = self.counts[resource_id as usize].fetch_add(amount, Ordering::AcqRel);
        previous.wrapping_add(amount) as usize
    }

    /// Subtract `amount` and return the new count
    pub fn decrement_count(&self, resource_id: ResourceId, amount: u32) -> usize {
        let previous = self.counts[resource_id as usize].fetch_sub(amount, Ordering::AcqRel);
        previous.wrapping_sub(amount) as usize
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, TAG)?;
        self.heads.save(writer)?;
        self.counts.save(writer)
    }

    /// Replace the contents with an index written by `save`; works on a fresh instance
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, TAG)?;
        let large_items = self.heads.budget().large_region_size();
        if !self.heads.ensure_reserved(large_items / size_of::<u64>())
            || !self.counts.ensure_reserved(large_items / size_of::<u32>())
        {
            return Err(StoreError::memory_allocation(
                TAG,
                large_items,
                0,
                "Cannot reserve address space for loaded index",
            ));
        }
        self.heads.load(reader).with_component_context(TAG)?;
        self.counts.load(reader).with_component_context(TAG)
    }

    /// Write one `id: count` line per covered identifier
    pub fn dump<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        let end = self.counts.end_index();
        let width = end.to_string().len();
        writeln!(writer, "{TAG}")?;
        writeln!(writer, "First free resource id: {end}")?;
        for resource_id in 0..end {
            writeln!(writer, "{resource_id:>width$}: {}", self.count(resource_id as ResourceId))?;
        }
        Ok(())
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let end = self.heads.end_index();
        let mut used_entries = 0u64;
        let mut sum_of_counts = 0u64;
        let mut max_count = 0u64;
        for resource_id in 0..end as ResourceId {
            if self.head(resource_id) != INVALID_TUPLE_INDEX {
                let count = self.count(resource_id) as u64;
                used_entries += 1;
                sum_of_counts += count;
                max_count = max_count.max(count);
            }
        }

        let entry_size = (std::mem::size_of::<u64>() + std::mem::size_of::<u32>()) as u64;
        let mut result = ComponentStatistics::new(TAG);
        result.add_integer_item("Size", end as u64 * entry_size);
        result.add_integer_item("Total number of entries", end as u64);
        result.add_integer_item("Number of used entries", used_entries);
        result.add_integer_item("The sum of all triple counts", sum_of_counts);
        result.add_integer_item("Maximum triple count", max_count);
        if used_entries != 0 {
            result.add_integer_item(
                "Average triple count",
                (sum_of_counts as f64 / used_entries as f64).round() as u64,
            );
        }
        result
    }
}
