//! Full (S, P, O) index over the record store
//!
//! Buckets hold only a tuple index; the key of a bucket is read back from the record
//! store on comparison. An empty bucket is claimed by parking the in-insertion
//! sentinel in it, so that of several threads inserting the same triple exactly one
//! appends it and the others observe it as already present.

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::hash_index::{
    BucketDescriptor, BucketPolicy, BucketStatus, ParallelHashIndex, combine_hash,
    load_resolved_tuple_index, try_claim_bucket,
};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{check_tag, write_tag};
use crate::statistics::ComponentStatistics;
use crate::triple_list::TripleRecordStore;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, instrument, warn};
use triplex_types::{INVALID_TUPLE_INDEX, ResourceId, TupleIndex, TupleStatus, tuple_status};

const TAG: &str = "ThreeKeysIndex";

/// Bucket policy keyed by a whole triple
pub struct ThreeKeysIndexPolicy<S: TripleRecordStore> {
    store: Arc<S>,
}

impl<S: TripleRecordStore> ThreeKeysIndexPolicy<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn hash_triple(triple: &[ResourceId; 3]) -> usize {
        combine_hash(triple)
    }
}

impl<S: TripleRecordStore> BucketPolicy for ThreeKeysIndexPolicy<S> {
    type Bucket = AtomicU64;
    type Key = [ResourceId; 3];
    type Contents = TupleIndex;

    fn hash_key(&self, key: &[ResourceId; 3]) -> usize {
        Self::hash_triple(key)
    }

    fn load_contents(&self, bucket: &AtomicU64) -> TupleIndex {
        load_resolved_tuple_index(bucket)
    }

    fn contents_status(&self, contents: &TupleIndex, key: &[ResourceId; 3]) -> BucketStatus {
        if *contents == INVALID_TUPLE_INDEX {
            BucketStatus::Empty
        } else if self.store.resource_ids(*contents) == *key {
            BucketStatus::Contains
        } else {
            BucketStatus::NotContains
        }
    }

    fn is_empty(&self, contents: &TupleIndex) -> bool {
        *contents == INVALID_TUPLE_INDEX
    }

    fn contents_hash(&self, contents: &TupleIndex) -> usize {
        Self::hash_triple(&self.store.resource_ids(*contents))
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

/// Result of asking for permission to append a triple
pub enum InsertOutcome<'a, S: TripleRecordStore> {
    /// The caller owns the bucket and must append the triple, then commit or abort
    Claimed(InsertToken<'a, S>),
    /// The triple is already indexed under this tuple index
    AlreadyExists(TupleIndex),
    /// The index is full and could not grow
    Failed,
}

/// Exclusive claim on an empty bucket.
///
/// Holds the index's shared lock until it is committed, aborted or dropped; dropping
/// an unresolved token aborts it. The holder must not query the same index meanwhile.
pub struct InsertToken<'a, S: TripleRecordStore> {
    descriptor: BucketDescriptor<'a, ThreeKeysIndexPolicy<S>>,
    resolved: bool,
}

impl<S: TripleRecordStore> InsertToken<'_, S> {
    /// Publish the appended triple's tuple index
    pub fn commit(mut self, tuple_index: TupleIndex) -> StoreResult<()> {
        self.descriptor.empty_bucket(TAG)?.store(tuple_index, Ordering::Release);
        self.descriptor.acknowledge_insert();
        self.resolved = true;
        Ok(())
    }

    /// Give the bucket back; waiting readers see it empty again
    pub fn abort(mut self) {
        self.release_claim();
    }

    fn release_claim(&mut self) {
        if let Some(bucket) = self.descriptor.bucket() {
            bucket.store(INVALID_TUPLE_INDEX, Ordering::Release);
        }
        self.resolved = true;
    }
}

impl<S: TripleRecordStore> Drop for InsertToken<'_, S> {
    fn drop(&mut self) {
        if !self.resolved {
            self.release_claim();
        }
    }
}

/// Index of every triple by its full key
pub struct ThreeKeysIndex<S: TripleRecordStore> {
    index: ParallelHashIndex<ThreeKeysIndexPolicy<S>>,
    config: StorageConfig,
}

impl<S: TripleRecordStore> ThreeKeysIndex<S> {
    pub fn new(store: Arc<S>, budget: Arc<MemoryBudget>, config: &StorageConfig) -> Self {
        Self {
            index: ParallelHashIndex::new(
                ThreeKeysIndexPolicy::new(store),
                budget,
                config.hash_table_load_factor,
                config.thread_count,
            ),
            config: config.clone(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.index.policy().store()
    }

    /// Size the table for `initial_triple_capacity` triples
    #[instrument(skip(self))]
    pub fn initialize(&mut self, initial_triple_capacity: usize) -> bool {
        let number_of_buckets = self.config.hash_table_size(initial_triple_capacity);
        self.index.initialize(number_of_buckets)
    }

    pub fn set_number_of_threads(&mut self, thread_count: usize) {
        self.index.set_number_of_threads(thread_count);
    }

    /// Find the triple or claim the bucket it belongs in
    pub fn insert_token(&self, triple: [ResourceId; 3]) -> InsertOutcome<'_, S> {
        let mut descriptor = self.index.acquire_bucket(&triple);
        loop {
            match descriptor.continue_bucket_search(&triple) {
                BucketStatus::Empty => {
                    let claimed = match descriptor.empty_bucket(TAG) {
                        Ok(bucket) => try_claim_bucket(bucket),
                        Err(err) => {
                            error!(error = %err, ?triple, "Cannot claim three-keys bucket");
                            return InsertOutcome::Failed;
                        }
                    };
                    if claimed {
                        return InsertOutcome::Claimed(InsertToken { descriptor, resolved: false });
                    }
                }
                BucketStatus::Contains => {
                    return InsertOutcome::AlreadyExists(
                        descriptor.contents().unwrap_or(INVALID_TUPLE_INDEX),
                    );
                }
                BucketStatus::NotContains => {
                    warn!(?triple, "Three-keys index is full");
                    return InsertOutcome::Failed;
                }
            }
        }
    }

    /// Index a triple that is already in the record store.
    ///
    /// Returns whether `tuple_index` was inserted and the tuple index now stored for the
    /// triple, or `None` when the index is full.
    pub fn insert_triple(
        &self,
        tuple_index: TupleIndex,
        triple: [ResourceId; 3],
    ) -> Option<(bool, TupleIndex)> {
        let mut descriptor = self.index.acquire_bucket(&triple);
        loop {
            match descriptor.continue_bucket_search(&triple) {
                BucketStatus::Empty => {
                    let inserted = match descriptor.empty_bucket(TAG) {
                        Ok(bucket) => self.index.policy().set_contents_if_empty(bucket, &tuple_index),
                        Err(err) => {
                            error!(error = %err, ?triple, "Cannot fill three-keys bucket");
                            return None;
                        }
                    };
                    if inserted {
                        descriptor.acknowledge_insert();
                        return Some((true, tuple_index));
                    }
                }
                BucketStatus::Contains => {
                    return Some((false, descriptor.contents().unwrap_or(INVALID_TUPLE_INDEX)));
                }
                BucketStatus::NotContains => return None,
            }
        }
    }

    /// Add a triple unless it is already indexed, escalating a full index as an error.
    ///
    /// `append` runs only when this call claims the triple's bucket and must return the
    /// tuple index it appended the triple under; if it fails the claim is released.
    /// Returns whether the triple was added and its tuple index.
    pub fn add_triple<F>(
        &self,
        triple: [ResourceId; 3],
        append: F,
    ) -> StoreResult<(bool, TupleIndex)>
    where
        F: FnOnce([ResourceId; 3]) -> StoreResult<TupleIndex>,
    {
        match self.insert_token(triple) {
            InsertOutcome::Claimed(token) => {
                let tuple_index = append(triple)?;
                token.commit(tuple_index)?;
                Ok((true, tuple_index))
            }
            InsertOutcome::AlreadyExists(tuple_index) => Ok((false, tuple_index)),
            InsertOutcome::Failed => Err(StoreError::capacity_for_resource(
                TAG,
                triple[0],
                format!("Cannot index triple {triple:?}: the index is full and could not grow"),
            )),
        }
    }

    /// Tuple index of a completely written triple, or `INVALID_TUPLE_INDEX`
    pub fn triple_index(&self, triple: [ResourceId; 3]) -> TupleIndex {
        match self.index.find(&triple) {
            Some(tuple_index)
                if self.store().triple_status(tuple_index) & tuple_status::COMPLETE
                    == tuple_status::COMPLETE =>
            {
                tuple_index
            }
            _ => INVALID_TUPLE_INDEX,
        }
    }

    /// True when the triple is indexed and `status & mask == expected`
    pub fn contains(
        &self,
        triple: [ResourceId; 3],
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> bool {
        self.index
            .find(&triple)
            .is_some_and(|tuple_index| self.store().triple_status(tuple_index) & mask == expected)
    }

    /// 1 for a derived triple that has not been merged away, otherwise 0
    pub fn count_estimate(&self, triple: [ResourceId; 3]) -> usize {
        usize::from(self.contains(
            triple,
            tuple_status::IDB | tuple_status::IDB_MERGED,
            tuple_status::IDB,
        ))
    }

    pub fn number_of_buckets(&self) -> usize {
        self.index.number_of_buckets()
    }

    pub fn number_of_used_buckets(&self) -> usize {
        self.index.number_of_used_buckets()
    }

    pub fn hash_index(&self) -> &ParallelHashIndex<ThreeKeysIndexPolicy<S>> {
        &self.index
    }

    #[instrument(skip_all)]
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, TAG)?;
        self.index.save(writer)
    }

    #[instrument(skip_all)]
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, TAG)?;
        self.index.load(reader)
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let number_of_buckets = self.number_of_buckets();
        let used = self.number_of_used_buckets();
        let size = self.index.bucket_bytes() as f64;

        let mut result = ComponentStatistics::new(TAG);
        result.add_integer_item("Size", size as u64);
        result.add_integer_item("Total number of buckets", number_of_buckets as u64);
        result.add_integer_item("Number of used buckets", used as u64);
        if used != 0 {
            result.add_float_item("Bytes per used bucket", size / used as f64);
        }
        if number_of_buckets != 0 {
            result.add_float_item("Load factor (%)", used as f64 * 100.0 / number_of_buckets as f64);
        }
        let triples = self.store().exact_triple_count(tuple_status::COMPLETE, tuple_status::COMPLETE);
        if triples != 0 {
            result.add_float_item("Bytes per triple", size / triples as f64);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryTripleList;
    use std::io::Cursor;

    fn setup() -> (Arc<MemoryTripleList>, ThreeKeysIndex<MemoryTripleList>) {
        let budget = Arc::new(MemoryBudget::new(usize::MAX, 1 << 24, 4096));
        let store = Arc::new(MemoryTripleList::new(budget.clone(), 100_000).unwrap());
        let config =
            StorageConfig { initial_bucket_count: 1024, thread_count: 4, ..StorageConfig::default() };
        let mut index = ThreeKeysIndex::new(store.clone(), budget, &config);
        assert!(index.initialize(0));
        (store, index)
    }

    fn add(
        store: &MemoryTripleList,
        index: &ThreeKeysIndex<MemoryTripleList>,
        triple: [ResourceId; 3],
    ) -> InsertResult {
        match index.insert_token(triple) {
            InsertOutcome::Claimed(token) => {
                let tuple_index = store.append(triple, tuple_status::IDB | tuple_status::COMPLETE);
                token.commit(tuple_index).unwrap();
                InsertResult::Added(tuple_index)
            }
            InsertOutcome::AlreadyExists(tuple_index) => InsertResult::Existing(tuple_index),
            InsertOutcome::Failed => InsertResult::Full,
        }
    }

    #[derive(Debug, PartialEq)]
    enum InsertResult {
        Added(TupleIndex),
        Existing(TupleIndex),
        Full,
    }

    #[test]
    fn test_second_insert_observes_existing_triple() {
        let (store, index) = setup();
        let InsertResult::Added(first) = add(&store, &index, [1, 2, 3]) else {
            panic!("first insert must claim");
        };
        assert_eq!(add(&store, &index, [1, 2, 3]), InsertResult::Existing(first));
        assert_eq!(index.number_of_used_buckets(), 1);
        assert_eq!(index.triple_index([1, 2, 3]), first);
        assert_eq!(index.triple_index([3, 2, 1]), INVALID_TUPLE_INDEX);
    }

    #[test]
    fn test_aborted_token_leaves_bucket_empty() {
        let (store, index) = setup();
        match index.insert_token([4, 5, 6]) {
            InsertOutcome::Claimed(token) => token.abort(),
            _ => panic!("expected a claim"),
        }
        match index.insert_token([4, 5, 6]) {
            InsertOutcome::Claimed(token) => drop(token),
            _ => panic!("aborted claim must be reusable"),
        }
        assert!(matches!(add(&store, &index, [4, 5, 6]), InsertResult::Added(_)));
        assert_eq!(index.number_of_used_buckets(), 1);
    }

    #[test]
    fn test_add_triple_appends_once() {
        let (store, index) = setup();
        let append = |triple: [ResourceId; 3]| -> StoreResult<TupleIndex> {
            Ok(store.append(triple, tuple_status::EDB | tuple_status::COMPLETE))
        };
        let (added, first) = index.add_triple([3, 1, 4], append).unwrap();
        assert!(added);
        let (added, again) = index.add_triple([3, 1, 4], append).unwrap();
        assert!(!added);
        assert_eq!(again, first);
        assert_eq!(store.len(), 1);
        assert_eq!(index.number_of_used_buckets(), 1);
    }

    #[test]
    fn test_add_triple_releases_claim_when_append_fails() {
        let (store, index) = setup();
        let err = index
            .add_triple([2, 7, 1], |_| Err(StoreError::capacity("MemoryTripleList", "full")))
            .unwrap_err();
        assert_eq!(err.category(), "capacity");
        assert_eq!(index.number_of_used_buckets(), 0);
        assert!(matches!(index.insert_token([2, 7, 1]), InsertOutcome::Claimed(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_triple_reports_full_index_as_capacity_error() {
        let budget = Arc::new(MemoryBudget::new(8 * 16, 1 << 24, 8));
        let store =
            Arc::new(MemoryTripleList::new(Arc::new(MemoryBudget::unlimited()), 1_000).unwrap());
        let config =
            StorageConfig { initial_bucket_count: 16, thread_count: 1, ..StorageConfig::default() };
        let mut index = ThreeKeysIndex::new(store.clone(), budget, &config);
        assert!(index.initialize(0));

        let append = |triple: [ResourceId; 3]| -> StoreResult<TupleIndex> {
            Ok(store.append(triple, tuple_status::EDB | tuple_status::COMPLETE))
        };
        let mut subject = 1;
        let err = loop {
            match index.add_triple([subject, 0, 0], append) {
                Ok((added, _)) => assert!(added),
                Err(err) => break err,
            }
            subject += 1;
            assert!(subject <= 17, "a 16-bucket index cannot hold more triples");
        };
        match err {
            StoreError::Capacity { resource_id, component, .. } => {
                assert_eq!(resource_id, Some(subject));
                assert_eq!(component.as_deref(), Some("ThreeKeysIndex"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(index.hash_index().resize_failed());
    }

    #[test]
    fn test_triple_index_requires_complete_status() {
        let (store, index) = setup();
        let tuple_index = store.append([7, 8, 9], tuple_status::EDB);
        assert_eq!(index.insert_triple(tuple_index, [7, 8, 9]), Some((true, tuple_index)));
        assert_eq!(index.triple_index([7, 8, 9]), INVALID_TUPLE_INDEX);
        assert!(index.contains([7, 8, 9], tuple_status::EDB, tuple_status::EDB));

        store.set_triple_status(tuple_index, tuple_status::EDB | tuple_status::COMPLETE);
        assert_eq!(index.triple_index([7, 8, 9]), tuple_index);

        let duplicate = store.append([7, 8, 9], tuple_status::EDB | tuple_status::COMPLETE);
        assert_eq!(index.insert_triple(duplicate, [7, 8, 9]), Some((false, tuple_index)));
    }

    #[test]
    fn test_count_estimate_counts_unmerged_derived_triples() {
        let (store, index) = setup();
        add(&store, &index, [1, 1, 1]);
        let merged = store.append([2, 2, 2], tuple_status::IDB | tuple_status::IDB_MERGED);
        index.insert_triple(merged, [2, 2, 2]);
        assert_eq!(index.count_estimate([1, 1, 1]), 1);
        assert_eq!(index.count_estimate([2, 2, 2]), 0);
        assert_eq!(index.count_estimate([9, 9, 9]), 0);
    }

    #[test]
    fn test_statistics_and_round_trip() {
        let (store, index) = setup();
        for value in 1..=200 {
            add(&store, &index, [value, value + 1, value + 2]);
        }
        let stats = index.component_statistics();
        assert_eq!(stats.integer_item("Number of used buckets"), Some(200));
        assert_eq!(stats.integer_item("Total number of buckets"), Some(1024));
        assert_eq!(stats.float_item("Bytes per triple"), Some(1024.0 * 8.0 / 200.0));

        let mut buffer = Vec::new();
        index.save(&mut buffer).unwrap();
        let config = StorageConfig { thread_count: 2, ..StorageConfig::default() };
        let budget = Arc::new(MemoryBudget::new(usize::MAX, 1 << 24, 4096));
        let mut restored = ThreeKeysIndex::new(store.clone(), budget, &config);
        restored.load(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(restored.number_of_used_buckets(), 200);
        for value in 1..=200 {
            assert_ne!(restored.triple_index([value, value + 1, value + 2]), INVALID_TUPLE_INDEX);
        }
    }
}
