//! Open-addressing hash indexes parameterized by a bucket policy
//!
//! The probing, resizing and persistence machinery is shared; a `BucketPolicy`
//! decides what a bucket holds, how it is hashed and when it matches a key. Lookups
//! follow a two-phase protocol: `acquire_bucket` positions a cursor at the key's home
//! bucket, and `continue_bucket_search` probes from there, so callers can run their
//! own logic (claiming, appending) between probe steps.

use crate::arena::{ArenaElement, GrowableArena};
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use triplex_types::{IN_INSERTION_TUPLE_INDEX, INVALID_TUPLE_INDEX, TupleIndex};

pub mod parallel;
pub mod sequential;

pub use parallel::{BucketDescriptor, ParallelHashIndex};
pub use sequential::SequentialHashIndex;

/// Outcome of examining a bucket against a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// The bucket is free and may be claimed
    Empty,
    /// The bucket holds the key
    Contains,
    /// The bucket holds another key, or no bucket was found after a full cycle
    NotContains,
}

/// Shape, hashing and equality of the buckets in a hash index
pub trait BucketPolicy: Send + Sync {
    /// Storage cell of one bucket
    type Bucket: ArenaElement;
    /// Lookup key
    type Key: ?Sized;
    /// Value read out of a bucket
    type Contents: Copy + std::fmt::Debug;

    fn hash_key(&self, key: &Self::Key) -> usize;

    /// Read a bucket. Implementations with a claim sentinel wait here until the
    /// claim resolves.
    fn load_contents(&self, bucket: &Self::Bucket) -> Self::Contents;

    fn contents_status(&self, contents: &Self::Contents, key: &Self::Key) -> BucketStatus;

    fn is_empty(&self, contents: &Self::Contents) -> bool;

    /// Hash of the key stored in non-empty `contents`
    fn contents_hash(&self, contents: &Self::Contents) -> usize;

    /// Atomically publish `contents` if the bucket is still empty
    fn set_contents_if_empty(&self, bucket: &Self::Bucket, contents: &Self::Contents) -> bool;

    fn clear_bucket(&self, bucket: &Self::Bucket);
}

/// Probe position carried between `continue_bucket_search` calls
#[derive(Debug, Clone, Copy)]
pub struct BucketCursor<C> {
    pub(crate) hash: usize,
    pub(crate) position: Option<usize>,
    pub(crate) contents: Option<C>,
}

impl<C: Copy> BucketCursor<C> {
    pub(crate) fn new(hash: usize) -> Self {
        Self { hash, position: None, contents: None }
    }

    /// Bucket index the last search stopped at
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Contents read from the bucket the last search stopped at
    pub fn contents(&self) -> Option<C> {
        self.contents
    }

    pub(crate) fn restart(&mut self) {
        self.position = None;
        self.contents = None;
    }
}

/// Linear probe with wrap-around starting at the cursor's bucket.
///
/// The current bucket is examined again before moving on, so a caller whose claim
/// lost a race re-reads the same bucket.
pub(crate) fn probe<P: BucketPolicy>(
    policy: &P,
    buckets: &GrowableArena<P::Bucket>,
    number_of_buckets: usize,
    cursor: &mut BucketCursor<P::Contents>,
    key: &P::Key,
) -> BucketStatus {
    let mask = number_of_buckets - 1;
    let start = cursor.position.unwrap_or(cursor.hash & mask);
    let mut position = start;
    let mut status;
    loop {
        let contents = policy.load_contents(&buckets[position]);
        status = policy.contents_status(&contents, key);
        cursor.contents = Some(contents);
        if status != BucketStatus::NotContains {
            break;
        }
        position = (position + 1) & mask;
        if position == start {
            break;
        }
    }
    cursor.position = Some(position);
    status
}

/// Rehash live buckets `[from, to)` of `old` into `new`, which has `new_buckets` buckets
pub(crate) fn rehash_range<P: BucketPolicy>(
    policy: &P,
    old: &GrowableArena<P::Bucket>,
    from: usize,
    to: usize,
    new: &GrowableArena<P::Bucket>,
    new_buckets: usize,
) {
    let mask = new_buckets - 1;
    for index in from..to {
        let contents = policy.load_contents(&old[index]);
        if policy.is_empty(&contents) {
            continue;
        }
        let mut position = policy.contents_hash(&contents) & mask;
        while !policy.set_contents_if_empty(&new[position], &contents) {
            position = (position + 1) & mask;
        }
    }
}

/// Jenkins one-at-a-time over whole words, with the final avalanche
pub fn combine_hash(values: &[u64]) -> usize {
    let mut hash: usize = 0;
    for &value in values {
        hash = hash.wrapping_add(value as usize);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Read a tuple-index bucket, waiting while another thread holds a claim on it
pub fn load_resolved_tuple_index(bucket: &AtomicU64) -> TupleIndex {
    let backoff = Backoff::new();
    loop {
        let tuple_index = bucket.load(Ordering::Acquire);
        if tuple_index != IN_INSERTION_TUPLE_INDEX {
            return tuple_index;
        }
        backoff.snooze();
    }
}

/// Claim an empty tuple-index bucket by parking the in-insertion sentinel in it
pub fn try_claim_bucket(bucket: &AtomicU64) -> bool {
    bucket
        .compare_exchange(
            INVALID_TUPLE_INDEX,
            IN_INSERTION_TUPLE_INDEX,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

/// Reserve and commit a bucket array of `number_of_buckets` entries
pub(crate) fn allocate_buckets<B: ArenaElement>(
    arena: &mut GrowableArena<B>,
    number_of_buckets: usize,
) -> bool {
    arena.reserve(number_of_buckets) && arena.ensure_end_at_least(0, number_of_buckets)
}


#[cfg(test)]
pub(crate) mod test_policy {
    //! Identity-keyed policy used by the index unit tests

    use super::*;

    /// Stores the key itself; zero is the empty value
    #[derive(Debug, Default)]
    pub struct IdentityPolicy;

    impl BucketPolicy for IdentityPolicy {
        type Bucket = AtomicU64;
        type Key = u64;
        type Contents = u64;

        fn hash_key(&self, key: &u64) -> usize {
            (*key as usize).wrapping_mul(0x9E37_79B9)
        }

        fn load_contents(&self, bucket: &AtomicU64) -> u64 {
            bucket.load(Ordering::Acquire)
        }

        fn contents_status(&self, contents: &u64, key: &u64) -> BucketStatus {
            match *contents {
                0 => BucketStatus::Empty,
                value if value == *key => BucketStatus::Contains,
                _ => BucketStatus::NotContains,
            }
        }

        fn is_empty(&self, contents: &u64) -> bool {
            *contents == 0
        }

        fn contents_hash(&self, contents: &u64) -> usize {
            self.hash_key(contents)
        }

        fn set_contents_if_empty(&self, bucket: &AtomicU64, contents: &u64) -> bool {
            bucket.compare_exchange(0, *contents, Ordering::AcqRel, Ordering::Acquire).is_ok()
        }

        fn clear_bucket(&self, bucket: &AtomicU64) {
            bucket.store(0, Ordering::Release);
        }
    }
}
