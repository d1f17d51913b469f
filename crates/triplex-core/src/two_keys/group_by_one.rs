//! Two-key index that groups triples on a single component

use super::{Chain, ChainStart, push_onto_chain, splice_after};
use crate::error::StoreResult;
use crate::memory_budget::MemoryBudget;
use crate::one_key_index::OneKeyIndex;
use crate::persistence::{check_tag, write_tag};
use crate::statistics::ComponentStatistics;
use crate::triple_list::TripleRecordStore;
use rayon::prelude::*;
use std::io::{Read, Write};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, instrument};
use triplex_types::{
    NOT_GROUPED_MASK, ResourceComponent, ResourceId, TupleIndex, tuple_status,
};

/// Chains of triples keyed by the value of `first`.
///
/// Lookups on `(first, second)` or `(first, third)` return the whole `first` chain and
/// leave filtering on the other component to the caller.
pub struct TwoKeysGroupIndex<S: TripleRecordStore> {
    store: Arc<S>,
    first: ResourceComponent,
    second: ResourceComponent,
    one_key: OneKeyIndex,
}

impl<S: TripleRecordStore> TwoKeysGroupIndex<S> {
    pub fn new(
        store: Arc<S>,
        first: ResourceComponent,
        second: ResourceComponent,
        budget: Arc<MemoryBudget>,
    ) -> Self {
        Self { store, first, second, one_key: OneKeyIndex::new(budget) }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn first(&self) -> ResourceComponent {
        self.first
    }

    pub fn second(&self) -> ResourceComponent {
        self.second
    }

    pub fn third(&self) -> ResourceComponent {
        self.first.remaining(self.second)
    }

    pub fn one_key_index(&self) -> &OneKeyIndex {
        &self.one_key
    }

    /// Persistence tag and report name, e.g. `TwoKeysGroupIndex[S.P]`
    pub fn tag(&self) -> String {
        format!("TwoKeysGroupIndex[{}.{}]", self.first, self.second)
    }

    #[instrument(skip(self), fields(first = %self.first, second = %self.second))]
    pub fn initialize(&mut self, initial_resource_capacity: usize) -> bool {
        if !self.one_key.initialize() {
            return false;
        }
        initial_resource_capacity == 0 || self.one_key.extend(initial_resource_capacity as ResourceId - 1)
    }

    /// Push the triple onto the chain of its `first` value and count it
    pub fn insert_triple(&self, tuple_index: TupleIndex, triple: [ResourceId; 3]) -> bool {
        let value = self.first.of(triple);
        if !self.one_key.extend(value) {
            return false;
        }
        push_onto_chain(&*self.store, &self.one_key, self.first, value, tuple_index);
        self.one_key.increment_count(value, 1);
        true
    }

    /// Link the triple behind `predecessor`, which must already be on the same chain
    pub fn splice_triple(
        &self,
        predecessor: TupleIndex,
        tuple_index: TupleIndex,
        triple: [ResourceId; 3],
    ) -> bool {
        let value = self.first.of(triple);
        if !self.one_key.extend(value) {
            return false;
        }
        splice_after(&*self.store, self.first, predecessor, tuple_index);
        self.one_key.increment_count(value, 1);
        true
    }

    pub fn first_triple_index_1(&self, value1: ResourceId) -> TupleIndex {
        self.one_key.head(value1)
    }

    pub fn first_triple_index_12(&self, value1: ResourceId, value2: ResourceId) -> ChainStart {
        ChainStart {
            head: self.one_key.head(value1),
            compare_component: self.second,
            compare_resource_id: value2,
            grouped_mask: NOT_GROUPED_MASK,
        }
    }

    pub fn first_triple_index_13(&self, value1: ResourceId, value3: ResourceId) -> ChainStart {
        ChainStart {
            head: self.one_key.head(value1),
            compare_component: self.third(),
            compare_resource_id: value3,
            grouped_mask: NOT_GROUPED_MASK,
        }
    }

    pub fn count_estimate_1(&self, value1: ResourceId) -> usize {
        self.one_key.count(value1)
    }

    pub fn count_estimate_12(&self, value1: ResourceId, _value2: ResourceId) -> usize {
        self.one_key.count(value1)
    }

    pub fn count_estimate_13(&self, value1: ResourceId, _value3: ResourceId) -> usize {
        self.one_key.count(value1)
    }

    /// Tuple indexes on the chain of `value1`, head first
    pub fn chain(&self, value1: ResourceId) -> Chain<'_, S> {
        Chain::new(&*self.store, self.first, self.one_key.head(value1))
    }

    /// Zero every count before a round of `update_statistics_for`
    pub fn start_updating_statistics(&mut self) -> bool {
        self.one_key.clear_counts()
    }

    pub fn update_statistics_for(&self, triple: [ResourceId; 3]) -> bool {
        let value = self.first.of(triple);
        if !self.one_key.extend(value) {
            return false;
        }
        self.one_key.increment_count(value, 1);
        true
    }

    /// Rebuild the counts from the complete triples in `range`
    #[instrument(skip(self), fields(index = %self.tag()))]
    pub fn recompute_statistics(&mut self, range: Range<TupleIndex>) -> bool {
        if !self.start_updating_statistics() {
            return false;
        }
        let store = &*self.store;
        let this = &*self;
        let failures = range
            .into_par_iter()
            .filter(|&tuple_index| {
                store.triple_status(tuple_index) & tuple_status::COMPLETE == tuple_status::COMPLETE
            })
            .filter(|&tuple_index| !this.update_statistics_for(store.resource_ids(tuple_index)))
            .count();
        debug!(failures, "Recomputed two-keys statistics");
        failures == 0
    }

    #[instrument(skip_all, fields(index = %self.tag()))]
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, &self.tag())?;
        self.one_key.save(writer)
    }

    #[instrument(skip_all, fields(index = %self.tag()))]
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, &self.tag())?;
        self.one_key.load(reader)
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let one_key = self.one_key.component_statistics();
        let size = one_key.integer_item("Size").unwrap_or(0);
        let mut result = ComponentStatistics::new(self.tag());
        result.add_integer_item("Aggregate size", size);
        let triples = self.store.exact_triple_count(tuple_status::COMPLETE, tuple_status::COMPLETE);
        if triples != 0 {
            result.add_float_item("Bytes per triple", size as f64 / triples as f64);
        }
        result.add_subcomponent(one_key);
        result
    }
}
