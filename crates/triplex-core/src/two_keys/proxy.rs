//! Insertion front end that pins frequent grouping values to a fixed splice point
//!
//! Small grouping values get a slot in a dense array holding the first triple ever
//! inserted for them; later triples are spliced directly behind it instead of
//! competing for the chain head. Larger values do the same through a hash index once
//! their chain is long enough. Everything else is pushed onto the chain as usual.

use super::TwoKeysGroupIndex;
use crate::arena::GrowableArena;
use crate::config::{StorageConfig, Threshold};
use crate::error::{ResultExt, StoreError, StoreResult};
use crate::hash_index::{
    BucketPolicy, BucketStatus, ParallelHashIndex, load_resolved_tuple_index, try_claim_bucket,
};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{check_tag, write_tag};
use crate::statistics::ComponentStatistics;
use crate::triple_list::TripleRecordStore;
use std::io::{Read, Write};
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, instrument, trace};
use triplex_types::{INVALID_TUPLE_INDEX, ResourceComponent, ResourceId, TupleIndex};

const TAG: &str = "TwoKeysGroupProxy";

/// How an insertion reached the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRoute {
    /// First triple of an array-tracked value; pushed and recorded in the array
    ArrayHead,
    /// Spliced behind the triple recorded in the array
    ArraySplice,
    /// First triple after the value became hot; pushed and recorded in the proxy hash
    HashHead,
    /// Spliced behind the triple recorded in the proxy hash
    HashSplice,
    /// Pushed onto the chain head
    Plain,
}

/// Proxy hash buckets hold the splice-point tuple index; the key is read back from the store
pub struct ProxyHashPolicy<S: TripleRecordStore> {
    store: Arc<S>,
    component: ResourceComponent,
}

impl<S: TripleRecordStore> ProxyHashPolicy<S> {
    pub fn new(store: Arc<S>, component: ResourceComponent) -> Self {
        Self { store, component }
    }

    pub fn hash_value(value: ResourceId) -> usize {
        (value ^ value.rotate_left(32)) as usize
    }
}

impl<S: TripleRecordStore> BucketPolicy for ProxyHashPolicy<S> {
    type Bucket = AtomicU64;
    type Key = ResourceId;
    type Contents = TupleIndex;

    fn hash_key(&self, key: &ResourceId) -> usize {
        Self::hash_value(*key)
    }

    fn load_contents(&self, bucket: &AtomicU64) -> TupleIndex {
        load_resolved_tuple_index(bucket)
    }

    fn contents_status(&self, contents: &TupleIndex, key: &ResourceId) -> BucketStatus {
        if *contents == INVALID_TUPLE_INDEX {
            BucketStatus::Empty
        } else if self.store.resource_id(*contents, self.component) == *key {
            BucketStatus::Contains
        } else {
            BucketStatus::NotContains
        }
    }

    fn is_empty(&self, contents: &TupleIndex) -> bool {
        *contents == INVALID_TUPLE_INDEX
    }

    fn contents_hash(&self, contents: &TupleIndex) -> usize {
        Self::hash_value(self.store.resource_id(*contents, self.component))
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

/// `TwoKeysGroupIndex` with splice points for frequent grouping values
pub struct TwoKeysGroupProxy<S: TripleRecordStore> {
    index: TwoKeysGroupIndex<S>,
    array: GrowableArena<AtomicU64>,
    hash: ParallelHashIndex<ProxyHashPolicy<S>>,
    array_threshold: u64,
    hash_threshold: Threshold,
    initial_bucket_count: usize,
}

impl<S: TripleRecordStore> TwoKeysGroupProxy<S> {
    pub fn new(
        store: Arc<S>,
        first: ResourceComponent,
        second: ResourceComponent,
        budget: Arc<MemoryBudget>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            index: TwoKeysGroupIndex::new(store.clone(), first, second, budget.clone()),
            array: GrowableArena::new(budget.clone(), 0),
            hash: ParallelHashIndex::new(
                ProxyHashPolicy::new(store, first),
                budget,
                config.hash_table_load_factor,
                config.thread_count,
            ),
            array_threshold: config.proxy_array_threshold,
            hash_threshold: config.proxy_hash_table_threshold,
            initial_bucket_count: config.initial_bucket_count,
        }
    }

    pub fn index(&self) -> &TwoKeysGroupIndex<S> {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut TwoKeysGroupIndex<S> {
        &mut self.index
    }

    #[instrument(skip(self))]
    pub fn initialize(&mut self, initial_resource_capacity: usize) -> bool {
        self.index.initialize(initial_resource_capacity)
            && (self.array_threshold == 0 || self.array.reserve(self.array_threshold as usize))
            && (self.hash_threshold.is_unlimited() || self.hash.initialize(self.initial_bucket_count))
    }

    pub fn insert_triple(&self, tuple_index: TupleIndex, triple: [ResourceId; 3]) -> bool {
        self.insert_triple_routed(tuple_index, triple).is_some()
    }

    /// Insert and report the route taken, or `None` when an index is out of room
    pub fn insert_triple_routed(
        &self,
        tuple_index: TupleIndex,
        triple: [ResourceId; 3],
    ) -> Option<ProxyRoute> {
        let value = self.index.first().of(triple);
        let route = if value < self.array_threshold {
            self.insert_through_array(tuple_index, triple, value)?
        } else if self.hash_threshold.is_reached_by(self.index.count_estimate_1(value)) {
            self.insert_through_hash(tuple_index, triple, value)?
        } else {
            self.index.insert_triple(tuple_index, triple).then_some(ProxyRoute::Plain)?
        };
        trace!(tuple_index, value, ?route, "Inserted triple through proxy");
        Some(route)
    }

    /// Splice point recorded for `value`, if any
    pub fn splice_point(&self, value: ResourceId) -> TupleIndex {
        if value < self.array_threshold {
            return self
                .array
                .get(value as usize)
                .map_or(INVALID_TUPLE_INDEX, |slot| slot.load(Ordering::Acquire));
        }
        self.hash.find(&value).unwrap_or(INVALID_TUPLE_INDEX)
    }

    fn insert_through_array(
        &self,
        tuple_index: TupleIndex,
        triple: [ResourceId; 3],
        value: ResourceId,
    ) -> Option<ProxyRoute> {
        if !self.array.ensure_end_at_least(value as usize, 1) {
            return None;
        }
        let slot = &self.array[value as usize];
        let head = slot.load(Ordering::Acquire);
        if head == INVALID_TUPLE_INDEX {
            if !self.index.insert_triple(tuple_index, triple) {
                return None;
            }
            // A racing head may win the slot; both triples are on the chain regardless
            let _ = slot.compare_exchange(
                INVALID_TUPLE_INDEX,
                tuple_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            Some(ProxyRoute::ArrayHead)
        } else {
            self.index.splice_triple(head, tuple_index, triple).then_some(ProxyRoute::ArraySplice)
        }
    }

    fn insert_through_hash(
        &self,
        tuple_index: TupleIndex,
        triple: [ResourceId; 3],
        value: ResourceId,
    ) -> Option<ProxyRoute> {
        let mut descriptor = self.hash.acquire_bucket(&value);
        loop {
            match descriptor.continue_bucket_search(&value) {
                BucketStatus::Empty => {
                    let bucket = match descriptor.empty_bucket(TAG) {
                        Ok(bucket) => bucket,
                        Err(err) => {
                            error!(error = %err, value, "Cannot claim proxy hash bucket");
                            return None;
                        }
                    };
                    if !try_claim_bucket(bucket) {
                        continue;
                    }
                    if !self.index.insert_triple(tuple_index, triple) {
                        bucket.store(INVALID_TUPLE_INDEX, Ordering::Release);
                        return None;
                    }
                    bucket.store(tuple_index, Ordering::Release);
                    descriptor.acknowledge_insert();
                    return Some(ProxyRoute::HashHead);
                }
                BucketStatus::Contains => {
                    let head = descriptor.contents().unwrap_or(INVALID_TUPLE_INDEX);
                    drop(descriptor);
                    return self
                        .index
                        .splice_triple(head, tuple_index, triple)
                        .then_some(ProxyRoute::HashSplice);
                }
                BucketStatus::NotContains => {
                    drop(descriptor);
                    return self.index.insert_triple(tuple_index, triple).then_some(ProxyRoute::Plain);
                }
            }
        }
    }

    pub fn number_of_array_entries(&self) -> usize {
        self.array.end_index()
    }

    pub fn proxy_hash(&self) -> &ParallelHashIndex<ProxyHashPolicy<S>> {
        &self.hash
    }

    #[instrument(skip_all)]
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, TAG)?;
        self.index.save(writer)?;
        self.array.save(writer)?;
        self.hash.save(writer)
    }

    #[instrument(skip_all)]
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, TAG)?;
        self.index.load(reader)?;
        if !self.array.ensure_reserved(self.array_threshold as usize) {
            return Err(StoreError::memory_allocation(
                TAG,
                self.array_threshold as usize * size_of::<AtomicU64>(),
                0,
                "Cannot reserve the splice point array",
            ));
        }
        self.array.load(reader).with_component_context(TAG)?;
        self.hash.load(reader)?;
        if !self.hash_threshold.is_unlimited()
            && !self.hash.is_initialized()
            && !self.hash.initialize(self.initial_bucket_count)
        {
            return Err(StoreError::memory_allocation(
                TAG,
                self.initial_bucket_count * size_of::<AtomicU64>(),
                0,
                "Cannot allocate the proxy hash index",
            ));
        }
        Ok(())
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let entries = self.array.end_index() as u64;
        let mut result = ComponentStatistics::new(TAG);
        result.add_integer_item("Total number of entries", entries);
        result.add_integer_item("Size", entries * std::mem::size_of::<AtomicU64>() as u64);

        let mut hash = ComponentStatistics::new("ProxyHashIndex");
        hash.add_integer_item("Total number of buckets", self.hash.number_of_buckets() as u64);
        hash.add_integer_item("Number of used buckets", self.hash.number_of_used_buckets() as u64);
        hash.add_integer_item("Size", self.hash.bucket_bytes() as u64);
        result.add_subcomponent(hash);
        result.add_subcomponent(self.index.component_statistics());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryTripleList;
    use std::io::Cursor;
    use triplex_types::tuple_status;

    fn budget() -> Arc<MemoryBudget> {
        Arc::new(MemoryBudget::new(usize::MAX, 1 << 24, 4096))
    }

    fn setup(config: &StorageConfig) -> (Arc<MemoryTripleList>, TwoKeysGroupProxy<MemoryTripleList>) {
        let store = Arc::new(MemoryTripleList::new(budget(), 10_000).unwrap());
        let mut proxy = TwoKeysGroupProxy::new(
            store.clone(),
            ResourceComponent::P,
            ResourceComponent::O,
            budget(),
            config,
        );
        assert!(proxy.initialize(0));
        (store, proxy)
    }

    fn config(array: u64, hash: Threshold) -> StorageConfig {
        StorageConfig {
            proxy_array_threshold: array,
            proxy_hash_table_threshold: hash,
            initial_bucket_count: 1024,
            thread_count: 2,
            ..StorageConfig::default()
        }
    }

    fn add(
        store: &MemoryTripleList,
        proxy: &TwoKeysGroupProxy<MemoryTripleList>,
        triple: [ResourceId; 3],
    ) -> (TupleIndex, ProxyRoute) {
        let tuple_index = store.append(triple, tuple_status::EDB | tuple_status::COMPLETE);
        (tuple_index, proxy.insert_triple_routed(tuple_index, triple).unwrap())
    }

    #[test]
    fn test_small_values_splice_behind_array_head() {
        let (store, proxy) = setup(&config(100, Threshold::Limit(50)));
        let (head, route) = add(&store, &proxy, [1, 50, 1]);
        assert_eq!(route, ProxyRoute::ArrayHead);
        assert_eq!(proxy.splice_point(50), head);

        let (second, route) = add(&store, &proxy, [2, 50, 2]);
        assert_eq!(route, ProxyRoute::ArraySplice);
        let (third, _) = add(&store, &proxy, [3, 50, 3]);

        let chain: Vec<_> = proxy.index().chain(50).collect();
        assert_eq!(chain, vec![head, third, second]);
        assert_eq!(proxy.index().count_estimate_1(50), 3);
    }

    #[test]
    fn test_large_values_switch_to_hash_at_threshold() {
        let (store, proxy) = setup(&config(100, Threshold::Limit(50)));
        for subject in 0..50 {
            assert_eq!(add(&store, &proxy, [subject, 500, 0]).1, ProxyRoute::Plain);
        }
        let (head, route) = add(&store, &proxy, [50, 500, 0]);
        assert_eq!(route, ProxyRoute::HashHead);
        assert_eq!(proxy.splice_point(500), head);
        assert_eq!(add(&store, &proxy, [51, 500, 0]).1, ProxyRoute::HashSplice);

        assert_eq!(proxy.index().chain(500).next(), Some(head));
        assert_eq!(proxy.index().chain(500).count(), 52);
        assert_eq!(proxy.proxy_hash().number_of_used_buckets(), 1);
    }

    #[test]
    fn test_unlimited_hash_threshold_always_pushes() {
        let (store, proxy) = setup(&config(0, Threshold::Unlimited));
        for subject in 0..200 {
            assert_eq!(add(&store, &proxy, [subject, 7, 0]).1, ProxyRoute::Plain);
        }
        assert_eq!(proxy.splice_point(7), INVALID_TUPLE_INDEX);
        assert_eq!(proxy.number_of_array_entries(), 0);
        assert!(!proxy.proxy_hash().is_initialized());
        assert_eq!(proxy.proxy_hash().bucket_bytes(), 0);
    }

    #[test]
    fn test_load_into_fresh_proxy_accepts_new_values() {
        let config = config(10_000, Threshold::Unlimited);
        let (store, proxy) = setup(&config);
        add(&store, &proxy, [1, 3, 0]);
        let mut buffer = Vec::new();
        proxy.save(&mut buffer).unwrap();

        let mut restored = TwoKeysGroupProxy::new(
            store.clone(),
            ResourceComponent::P,
            ResourceComponent::O,
            budget(),
            &config,
        );
        restored.load(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(restored.splice_point(3), proxy.splice_point(3));
        assert_eq!(add(&store, &restored, [2, 9_000, 0]).1, ProxyRoute::ArrayHead);
        assert_eq!(add(&store, &restored, [3, 9_000, 0]).1, ProxyRoute::ArraySplice);
        assert_eq!(add(&store, &restored, [4, 50_000, 0]).1, ProxyRoute::Plain);
        assert_eq!(restored.index().count_estimate_1(50_000), 1);
    }

    #[test]
    fn test_proxy_hash_is_keyed_by_value() {
        assert_eq!(ProxyHashPolicy::<MemoryTripleList>::hash_value(1), (1u64 | 1u64 << 32) as usize);
    }

    #[test]
    fn test_statistics_and_round_trip() {
        let config = config(100, Threshold::Limit(2));
        let (store, proxy) = setup(&config);
        for subject in 0..5 {
            add(&store, &proxy, [subject, 10, 0]);
            add(&store, &proxy, [subject, 1_000, 0]);
        }
        let stats = proxy.component_statistics();
        let entries = stats.integer_item("Total number of entries").unwrap();
        assert!(entries > 10);
        assert_eq!(stats.integer_item("Size"), Some(entries * 8));
        assert_eq!(
            stats.subcomponent("ProxyHashIndex").unwrap().integer_item("Number of used buckets"),
            Some(1)
        );

        let mut buffer = Vec::new();
        proxy.save(&mut buffer).unwrap();
        let mut restored = TwoKeysGroupProxy::new(
            store.clone(),
            ResourceComponent::P,
            ResourceComponent::O,
            budget(),
            &config,
        );
        assert!(restored.initialize(0));
        restored.load(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(restored.splice_point(1_000), proxy.splice_point(1_000));
        assert_eq!(restored.index().count_estimate_1(10), 5);
        let (_, route) = add(&store, &restored, [9, 1_000, 0]);
        assert_eq!(route, ProxyRoute::HashSplice);
    }
}
