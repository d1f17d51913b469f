//! Single-threaded open-addressing hash index

use super::{BucketCursor, BucketPolicy, BucketStatus, allocate_buckets, probe, rehash_range};
use crate::arena::GrowableArena;
use crate::error::{StoreError, StoreResult};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{check_tag, read_bool, read_usize, write_bool, write_tag, write_usize};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

const TAG: &str = "SequentialHashIndex";

/// Hash index for callers that own it exclusively.
///
/// Occupancy is tracked by the caller through `acknowledge_insert`; a resize runs
/// inside `acquire_bucket` once occupancy exceeds `number_of_buckets * load_factor`.
pub struct SequentialHashIndex<P: BucketPolicy> {
    policy: P,
    load_factor: f64,
    buckets: GrowableArena<P::Bucket>,
    number_of_buckets: usize,
    used: usize,
    resize_threshold: usize,
    resize_failed: bool,
}

impl<P: BucketPolicy> SequentialHashIndex<P> {
    pub fn new(policy: P, budget: Arc<MemoryBudget>, load_factor: f64) -> Self {
        Self {
            policy,
            load_factor,
            buckets: GrowableArena::new(budget, 0),
            number_of_buckets: 0,
            used: 0,
            resize_threshold: 0,
            resize_failed: false,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Allocate `initial_number_of_buckets` (rounded up to a power of two) empty buckets
    pub fn initialize(&mut self, initial_number_of_buckets: usize) -> bool {
        let number_of_buckets = initial_number_of_buckets.max(1).next_power_of_two();
        if !allocate_buckets(&mut self.buckets, number_of_buckets) {
            return false;
        }
        self.number_of_buckets = number_of_buckets;
        self.used = 0;
        self.resize_threshold = (number_of_buckets as f64 * self.load_factor) as usize;
        self.resize_failed = false;
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.number_of_buckets != 0
    }

    /// Hash `key` and position a cursor at its home bucket, resizing first if needed
    pub fn acquire_bucket(&mut self, key: &P::Key) -> BucketCursor<P::Contents> {
        if self.used > self.resize_threshold {
            self.resize();
        }
        BucketCursor::new(self.policy.hash_key(key))
    }

    pub fn continue_bucket_search(
        &self,
        cursor: &mut BucketCursor<P::Contents>,
        key: &P::Key,
    ) -> BucketStatus {
        if !self.is_initialized() {
            return BucketStatus::NotContains;
        }
        probe(&self.policy, &self.buckets, self.number_of_buckets, cursor, key)
    }

    /// Bucket the cursor is parked on
    pub fn bucket(&self, cursor: &BucketCursor<P::Contents>) -> Option<&P::Bucket> {
        cursor.position.map(|position| &self.buckets[position])
    }

    pub fn acknowledge_insert(&mut self) {
        self.used += 1;
    }

    /// Empty the cursor's bucket and shift later entries of its probe run back
    pub fn delete_bucket(&mut self, cursor: &BucketCursor<P::Contents>) {
        let Some(mut hole) = cursor.position else {
            return;
        };
        let mask = self.number_of_buckets - 1;
        self.policy.clear_bucket(&self.buckets[hole]);
        self.used = self.used.saturating_sub(1);

        let mut scan = (hole + 1) & mask;
        loop {
            let contents = self.policy.load_contents(&self.buckets[scan]);
            if self.policy.is_empty(&contents) {
                break;
            }
            let home = self.policy.contents_hash(&contents) & mask;
            // Move unless `home` lies cyclically in (hole, scan]
            let must_move =
                if hole <= scan { home <= hole || scan < home } else { home <= hole && scan < home };
            if must_move {
                self.policy.set_contents_if_empty(&self.buckets[hole], &contents);
                self.policy.clear_bucket(&self.buckets[scan]);
                hole = scan;
            }
            scan = (scan + 1) & mask;
        }
    }

    pub fn number_of_buckets(&self) -> usize {
        self.number_of_buckets
    }

    pub fn number_of_used_buckets(&self) -> usize {
        self.used
    }

    pub fn resize_failed(&self) -> bool {
        self.resize_failed
    }

    fn resize(&mut self) {
        if self.resize_failed {
            return;
        }
        let new_number_of_buckets = self.number_of_buckets * 2;
        let mut new_buckets = GrowableArena::new(self.buckets.budget().clone(), 0);
        if !allocate_buckets(&mut new_buckets, new_number_of_buckets) {
            self.resize_failed = true;
            warn!(
                number_of_buckets = self.number_of_buckets,
                used = self.used,
                "Hash index resize failed; continuing in the current table"
            );
            return;
        }
        rehash_range(
            &self.policy,
            &self.buckets,
            0,
            self.number_of_buckets,
            &new_buckets,
            new_number_of_buckets,
        );
        self.buckets = new_buckets;
        self.number_of_buckets = new_number_of_buckets;
        self.resize_threshold = (new_number_of_buckets as f64 * self.load_factor) as usize;
        debug!(number_of_buckets = new_number_of_buckets, used = self.used, "Hash index resized");
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        write_tag(writer, TAG)?;
        write_usize(writer, self.number_of_buckets)?;
        write_usize(writer, self.used)?;
        write_usize(writer, self.resize_threshold)?;
        write_bool(writer, self.resize_failed)?;
        self.buckets.save(writer)
    }

    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, TAG)?;
        let number_of_buckets = read_usize(reader)?;
        let used = read_usize(reader)?;
        let resize_threshold = read_usize(reader)?;
        let resize_failed = read_bool(reader)?;
        if !number_of_buckets.is_power_of_two() {
            return Err(StoreError::serialization(
                TAG,
                "load",
                format!("Bucket count {number_of_buckets} is not a power of two"),
            ));
        }
        self.buckets.load(reader)?;
        if self.buckets.end_index() < number_of_buckets {
            return Err(StoreError::serialization(
                TAG,
                "load",
                "Bucket array is shorter than the recorded bucket count",
            ));
        }
        self.number_of_buckets = number_of_buckets;
        self.used = used;
        self.resize_threshold = resize_threshold;
        self.resize_failed = resize_failed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_index::test_policy::IdentityPolicy;
    use std::io::Cursor;

    fn index(budget: Arc<MemoryBudget>) -> SequentialHashIndex<IdentityPolicy> {
        let mut index = SequentialHashIndex::new(IdentityPolicy, budget, 0.7);
        assert!(index.initialize(16));
        index
    }

    fn insert(index: &mut SequentialHashIndex<IdentityPolicy>, key: u64) -> BucketStatus {
        let mut cursor = index.acquire_bucket(&key);
        let status = index.continue_bucket_search(&mut cursor, &key);
        if status == BucketStatus::Empty {
            let bucket = index.bucket(&cursor).unwrap();
            assert!(index.policy().set_contents_if_empty(bucket, &key));
            index.acknowledge_insert();
        }
        status
    }

    fn lookup(index: &mut SequentialHashIndex<IdentityPolicy>, key: u64) -> BucketStatus {
        let mut cursor = index.acquire_bucket(&key);
        index.continue_bucket_search(&mut cursor, &key)
    }

    #[test]
    fn test_second_insert_observes_contains() {
        let mut index = index(Arc::new(MemoryBudget::unlimited()));
        assert_eq!(insert(&mut index, 5), BucketStatus::Empty);
        assert_eq!(insert(&mut index, 5), BucketStatus::Contains);
        assert_eq!(index.number_of_used_buckets(), 1);
    }

    #[test]
    fn test_resize_preserves_contents_and_occupancy() {
        let mut index = index(Arc::new(MemoryBudget::unlimited()));
        for key in 1..=1000 {
            assert_eq!(insert(&mut index, key), BucketStatus::Empty);
        }
        assert!(index.number_of_buckets() >= 1024);
        assert_eq!(index.number_of_used_buckets(), 1000);
        for key in 1..=1000 {
            assert_eq!(lookup(&mut index, key), BucketStatus::Contains, "key {key}");
        }
        assert_eq!(lookup(&mut index, 1001), BucketStatus::Empty);
    }

    #[test]
    fn test_delete_keeps_probe_runs_reachable() {
        let mut index = index(Arc::new(MemoryBudget::unlimited()));
        for key in 1..=10 {
            insert(&mut index, key);
        }
        for key in (1..=10).step_by(2) {
            let mut cursor = index.acquire_bucket(&key);
            assert_eq!(index.continue_bucket_search(&mut cursor, &key), BucketStatus::Contains);
            index.delete_bucket(&cursor);
        }
        assert_eq!(index.number_of_used_buckets(), 5);
        for key in 1..=10 {
            let expected =
                if key % 2 == 0 { BucketStatus::Contains } else { BucketStatus::Empty };
            assert_eq!(lookup(&mut index, key), expected, "key {key}");
        }
    }

    #[test]
    fn test_failed_resize_keeps_inserting_until_full() {
        // Room for the initial 16 buckets only
        let budget = Arc::new(MemoryBudget::new(16 * 8, 1 << 20, 4096));
        let mut index = index(budget);

        for key in 1..=16 {
            assert_eq!(insert(&mut index, key), BucketStatus::Empty, "key {key}");
        }
        assert!(index.resize_failed());
        assert_eq!(index.number_of_buckets(), 16);
        assert_eq!(insert(&mut index, 17), BucketStatus::NotContains);
        assert_eq!(lookup(&mut index, 3), BucketStatus::Contains);
    }

    #[test]
    fn test_save_load_round_trip() {
        let budget = Arc::new(MemoryBudget::unlimited());
        let mut index = index(budget.clone());
        for key in 1..=100 {
            insert(&mut index, key * 7);
        }
        let mut buffer = Vec::new();
        index.save(&mut buffer).unwrap();

        let mut restored = SequentialHashIndex::new(IdentityPolicy, budget, 0.7);
        restored.load(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(restored.number_of_buckets(), index.number_of_buckets());
        assert_eq!(restored.number_of_used_buckets(), 100);
        for key in 1..=100 {
            assert_eq!(lookup(&mut restored, key * 7), BucketStatus::Contains);
        }
    }

    #[test]
    fn test_load_rejects_other_structure() {
        let mut buffer = Vec::new();
        write_tag(&mut buffer, "ParallelHashIndex").unwrap();
        let mut index = SequentialHashIndex::new(IdentityPolicy, Arc::new(MemoryBudget::unlimited()), 0.7);
        let err = index.load(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(err.to_string().contains("SequentialHashIndex"));
    }
}
