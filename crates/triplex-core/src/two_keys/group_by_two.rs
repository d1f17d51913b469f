//! Two-key index that keeps the triples of each `(first, second)` pair contiguous
//!
//! A hash index keyed by the pair records the first triple inserted for it. Later
//! triples of the pair are spliced behind that triple, so a scan for the pair can stop
//! as soon as the `second` component changes.

use super::{Chain, ChainStart, push_onto_chain, splice_after};
use crate::config::StorageConfig;
use crate::error::StoreResult;
use crate::hash_index::{
    BucketPolicy, BucketStatus, ParallelHashIndex, combine_hash, load_resolved_tuple_index,
    try_claim_bucket,
};
use crate::memory_budget::MemoryBudget;
use crate::one_key_index::OneKeyIndex;
use crate::persistence::{check_tag, write_tag};
use crate::statistics::ComponentStatistics;
use crate::triple_list::TripleRecordStore;
use rayon::prelude::*;
use std::io::{Read, Write};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, instrument, warn};
use triplex_types::{
    GROUPED_MASK, INVALID_TUPLE_INDEX, NOT_GROUPED_MASK, ResourceComponent, ResourceId,
    TupleIndex, tuple_status,
};

/// Buckets hold the head of a pair's run
pub struct PairPolicy<S: TripleRecordStore> {
    store: Arc<S>,
    first: ResourceComponent,
    second: ResourceComponent,
}

impl<S: TripleRecordStore> PairPolicy<S> {
    fn pair_of(&self, tuple_index: TupleIndex) -> [ResourceId; 2] {
        let triple = self.store.resource_ids(tuple_index);
        [self.first.of(triple), self.second.of(triple)]
    }
}

impl<S: TripleRecordStore> BucketPolicy for PairPolicy<S> {
    type Bucket = AtomicU64;
    type Key = [ResourceId; 2];
    type Contents = TupleIndex;

    fn hash_key(&self, key: &[ResourceId; 2]) -> usize {
        combine_hash(key)
    }

    fn load_contents(&self, bucket: &AtomicU64) -> TupleIndex {
        load_resolved_tuple_index(bucket)
    }

    fn contents_status(&self, contents: &TupleIndex, key: &[ResourceId; 2]) -> BucketStatus {
        if *contents == INVALID_TUPLE_INDEX {
            BucketStatus::Empty
        } else if self.pair_of(*contents) == *key {
            BucketStatus::Contains
        } else {
            BucketStatus::NotContains
        }
    }

    fn is_empty(&self, contents: &TupleIndex) -> bool {
        *contents == INVALID_TUPLE_INDEX
    }

    fn contents_hash(&self, contents: &TupleIndex) -> usize {
        combine_hash(&self.pair_of(*contents))
    }

    fn set_contents_if_empty(&self, bucket: &AtomicU64, contents: &TupleIndex) -> bool {
        bucket
            .compare_exchange(INVALID_TUPLE_INDEX, *contents, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn clear_bucket(&self, bucket: &AtomicU64) {
        bucket.store(INVALID_TUPLE_INDEX, Ordering::Release);
    }
}

pub struct TwoKeysPairIndex<S: TripleRecordStore> {
    store: Arc<S>,
    first: ResourceComponent,
    second: ResourceComponent,
    one_key: OneKeyIndex,
    pairs: ParallelHashIndex<PairPolicy<S>>,
    config: StorageConfig,
}

impl<S: TripleRecordStore> TwoKeysPairIndex<S> {
    pub fn new(
        store: Arc<S>,
        first: ResourceComponent,
        second: ResourceComponent,
        budget: Arc<MemoryBudget>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            one_key: OneKeyIndex::new(budget.clone()),
            pairs: ParallelHashIndex::new(
                PairPolicy { store: store.clone(), first, second },
                budget,
                config.hash_table_load_factor,
                config.thread_count,
            ),
            store,
            first,
            second,
            config: config.clone(),
        }
    }

    pub fn tag(&self) -> String {
        format!("TwoKeysPairIndex[{}.{}]", self.first, self.second)
    }

    pub fn third(&self) -> ResourceComponent {
        self.first.remaining(self.second)
    }

    #[instrument(skip(self))]
    pub fn initialize(&mut self, initial_resource_capacity: usize, initial_pair_capacity: usize) -> bool {
        let number_of_buckets = self.config.hash_table_size(initial_pair_capacity);
        self.one_key.initialize()
            && (initial_resource_capacity == 0
                || self.one_key.extend(initial_resource_capacity as ResourceId - 1))
            && self.pairs.initialize(number_of_buckets)
    }

    /// Insert into the pair's run, opening a new run at the chain head for a new pair
    pub fn insert_triple(&self, tuple_index: TupleIndex, triple: [ResourceId; 3]) -> bool {
        let value1 = self.first.of(triple);
        if !self.one_key.extend(value1) {
            return false;
        }
        let pair = [value1, self.second.of(triple)];
        let mut descriptor = self.pairs.acquire_bucket(&pair);
        loop {
            match descriptor.continue_bucket_search(&pair) {
                BucketStatus::Empty => {
                    let bucket = match descriptor.empty_bucket(&self.tag()) {
                        Ok(bucket) => bucket,
                        Err(err) => {
                            error!(error = %err, ?pair, "Cannot claim pair bucket");
                            return false;
                        }
                    };
                    if !try_claim_bucket(bucket) {
                        continue;
                    }
                    push_onto_chain(&*self.store, &self.one_key, self.first, value1, tuple_index);
                    bucket.store(tuple_index, Ordering::Release);
                    descriptor.acknowledge_insert();
                    break;
                }
                BucketStatus::Contains => {
                    let head = descriptor.contents().unwrap_or(INVALID_TUPLE_INDEX);
                    splice_after(&*self.store, self.first, head, tuple_index);
                    break;
                }
                BucketStatus::NotContains => {
                    warn!(index = %self.tag(), ?pair, "Pair hash index is full");
                    return false;
                }
            }
        }
        self.one_key.increment_count(value1, 1);
        true
    }

    pub fn first_triple_index_1(&self, value1: ResourceId) -> TupleIndex {
        self.one_key.head(value1)
    }

    /// Head of the pair's run; every matching triple follows it without gaps
    pub fn first_triple_index_12(&self, value1: ResourceId, value2: ResourceId) -> ChainStart {
        ChainStart {
            head: self.pairs.find(&[value1, value2]).unwrap_or(INVALID_TUPLE_INDEX),
            compare_component: self.second,
            compare_resource_id: value2,
            grouped_mask: GROUPED_MASK,
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

    /// Length of the pair's run
    pub fn count_estimate_12(&self, value1: ResourceId, value2: ResourceId) -> usize {
        let start = self.first_triple_index_12(value1, value2);
        Chain::new(&*self.store, self.first, start.head)
            .take_while(|&tuple_index| self.store.resource_id(tuple_index, self.second) == value2)
            .count()
    }

    pub fn count_estimate_13(&self, value1: ResourceId, _value3: ResourceId) -> usize {
        self.one_key.count(value1)
    }

    pub fn chain(&self, value1: ResourceId) -> Chain<'_, S> {
        Chain::new(&*self.store, self.first, self.one_key.head(value1))
    }

    /// Zero every count before a round of `update_statistics_for`
    pub fn start_updating_statistics(&mut self) -> bool {
        self.one_key.clear_counts()
    }

    pub fn update_statistics_for(&self, triple: [ResourceId; 3]) -> bool {
        let value1 = self.first.of(triple);
        if !self.one_key.extend(value1) {
            return false;
        }
        self.one_key.increment_count(value1, 1);
        true
    }

    /// Rebuild the per-value counts from the complete triples in `range`
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
        debug!(failures, "Recomputed pair index statistics");
        failures == 0
    }

    pub fn number_of_pairs(&self) -> usize {
        self.pairs.number_of_used_buckets()
    }

    #[instrument(skip_all, fields(index = %self.tag()))]
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, &self.tag())?;
        self.one_key.save(writer)?;
        self.pairs.save(writer)
    }

    #[instrument(skip_all, fields(index = %self.tag()))]
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, &self.tag())?;
        self.one_key.load(reader)?;
        self.pairs.load(reader)
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let one_key = self.one_key.component_statistics();
        let size = one_key.integer_item("Size").unwrap_or(0) + self.pairs.bucket_bytes() as u64;
        let mut result = ComponentStatistics::new(self.tag());
        result.add_integer_item("Aggregate size", size);
        let triples = self.store.exact_triple_count(tuple_status::COMPLETE, tuple_status::COMPLETE);
        if triples != 0 {
            result.add_float_item("Bytes per triple", size as f64 / triples as f64);
        }

        let mut pairs = ComponentStatistics::new("PairHashIndex");
        pairs.add_integer_item("Total number of buckets", self.pairs.number_of_buckets() as u64);
        pairs.add_integer_item("Number of used buckets", self.pairs.number_of_used_buckets() as u64);
        result.add_subcomponent(one_key);
        result.add_subcomponent(pairs);
        result
    }
}
