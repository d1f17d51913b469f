//! Hash index safe for concurrent insertion with cooperative resizing
//!
//! Bucket operations run under a shared lock on the index. Growing the table takes
//! the lock exclusively only long enough to swap in a doubled bucket array; the old
//! array is then rehashed in chunks of `RESIZE_CHUNK_SIZE` buckets by every thread
//! that touches the index, again under the shared lock. The thread that finishes the
//! last chunk releases the old array and clears the in-progress marker; the others
//! wait for it.
//!
//! Occupancy is counted per thread and folded into a global counter once a thread's
//! count reaches its window, so the resize trigger subtracts a safety margin covering
//! the counts that may still be unflushed.
//!
//! A thread must not hold two `BucketDescriptor`s on the same index at once: starting
//! a resize releases the caller's own shared lock and waits for every other holder.

use super::{BucketCursor, BucketPolicy, BucketStatus, allocate_buckets, probe, rehash_range};
use crate::arena::{ArenaElement, GrowableArena};
use crate::constants::parallel::{RESIZE_CHUNK_SIZE, WINDOW_FACTOR};
use crate::error::{StoreError, StoreResult};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{check_tag, read_bool, read_usize, write_bool, write_tag, write_usize};
use crossbeam::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};
use crossbeam_utils::{Backoff, CachePadded};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

const TAG: &str = "ParallelHashIndex";

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

fn thread_slot() -> usize {
    THREAD_SLOT.with(|slot| *slot)
}

/// Bucket arrays guarded by the index lock
struct Table<B: ArenaElement> {
    current: GrowableArena<B>,
    number_of_buckets: usize,
    /// Array being rehashed into `current`; kept mapped until the next exclusive section
    retiring: GrowableArena<B>,
    retiring_buckets: usize,
    resize_threshold: usize,
}

#[derive(Default)]
struct ResizeProgress {
    /// Chunks in the running resize; zero when no resize is in progress
    chunks: AtomicUsize,
    next_chunk: AtomicUsize,
    chunks_to_finish: AtomicUsize,
    resize_count: AtomicUsize,
    chunks_rehashed: AtomicUsize,
}

impl ResizeProgress {
    fn is_in_progress(&self) -> bool {
        self.chunks.load(Ordering::Acquire) != 0
    }
}

/// Concurrent open-addressing hash index
pub struct ParallelHashIndex<P: BucketPolicy> {
    policy: P,
    load_factor: f64,
    budget: Arc<MemoryBudget>,
    table: ShardedLock<Table<P::Bucket>>,
    used: AtomicUsize,
    local_counts: Box<[CachePadded<AtomicUsize>]>,
    counter_window: AtomicUsize,
    threshold_minus_safety: AtomicUsize,
    resize_failed: AtomicBool,
    resize: ResizeProgress,
}

impl<P: BucketPolicy> ParallelHashIndex<P> {
    pub fn new(policy: P, budget: Arc<MemoryBudget>, load_factor: f64, thread_count: usize) -> Self {
        Self {
            policy,
            load_factor,
            table: ShardedLock::new(Table {
                current: GrowableArena::new(budget.clone(), 0),
                number_of_buckets: 0,
                retiring: GrowableArena::new(budget.clone(), 0),
                retiring_buckets: 0,
                resize_threshold: 0,
            }),
            budget,
            used: AtomicUsize::new(0),
            local_counts: new_local_counts(thread_count),
            counter_window: AtomicUsize::new(0),
            threshold_minus_safety: AtomicUsize::new(0),
            resize_failed: AtomicBool::new(false),
            resize: ResizeProgress::default(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Allocate `initial_number_of_buckets` (rounded up to a power of two) empty buckets
    /// and reset every counter
    pub fn initialize(&mut self, initial_number_of_buckets: usize) -> bool {
        let number_of_buckets = initial_number_of_buckets.max(1).next_power_of_two();
        let load_factor = self.load_factor;
        let budget = self.budget.clone();
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.retiring = GrowableArena::new(budget, 0);
        table.retiring_buckets = 0;
        if !allocate_buckets(&mut table.current, number_of_buckets) {
            table.number_of_buckets = 0;
            return false;
        }
        table.number_of_buckets = number_of_buckets;
        table.resize_threshold = (number_of_buckets as f64 * load_factor) as usize;
        let resize_threshold = table.resize_threshold;

        *self.used.get_mut() = 0;
        for count in self.local_counts.iter_mut() {
            *count.get_mut() = 0;
        }
        *self.resize_failed.get_mut() = false;
        self.reset_resize_progress();
        self.initialize_counter_window(number_of_buckets, resize_threshold);
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.read_table().number_of_buckets != 0
    }

    /// Change the number of local insertion counters.
    ///
    /// Outstanding local counts are folded into the global counter first.
    pub fn set_number_of_threads(&mut self, thread_count: usize) {
        let unflushed: usize = self.local_counts.iter_mut().map(|count| *count.get_mut()).sum();
        *self.used.get_mut() += unflushed;
        self.local_counts = new_local_counts(thread_count);
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        let (number_of_buckets, resize_threshold) = (table.number_of_buckets, table.resize_threshold);
        self.initialize_counter_window(number_of_buckets, resize_threshold);
    }

    pub fn number_of_threads(&self) -> usize {
        self.local_counts.len()
    }

    /// Take the shared lock and hash `key`; the lock is held until the descriptor drops
    pub fn acquire_bucket(&self, key: &P::Key) -> BucketDescriptor<'_, P> {
        BucketDescriptor {
            index: self,
            guard: Some(self.read_table()),
            cursor: BucketCursor::new(self.policy.hash_key(key)),
        }
    }

    /// Count one newly occupied bucket against the calling thread's local counter
    pub fn acknowledge_insert(&self) {
        let local = self.local_count();
        if local.fetch_add(1, Ordering::AcqRel) + 1 >= self.counter_window.load(Ordering::Acquire) {
            let flushed = local.swap(0, Ordering::AcqRel);
            self.used.fetch_add(flushed, Ordering::AcqRel);
        }
    }

    /// Read-only lookup.
    ///
    /// While a resize is in progress the array being rehashed is searched before the
    /// new one, so an entry is never missed while it moves.
    pub fn find(&self, key: &P::Key) -> Option<P::Contents> {
        let table = self.read_table();
        if table.number_of_buckets == 0 {
            return None;
        }
        let hash = self.policy.hash_key(key);
        if self.resize.is_in_progress() && table.retiring_buckets != 0 {
            let mut cursor = BucketCursor::new(hash);
            if probe(&self.policy, &table.retiring, table.retiring_buckets, &mut cursor, key)
                == BucketStatus::Contains
            {
                return cursor.contents;
            }
        }
        let mut cursor = BucketCursor::new(hash);
        match probe(&self.policy, &table.current, table.number_of_buckets, &mut cursor, key) {
            BucketStatus::Contains => cursor.contents,
            BucketStatus::Empty | BucketStatus::NotContains => None,
        }
    }

    pub fn number_of_buckets(&self) -> usize {
        self.read_table().number_of_buckets
    }

    /// Global count plus every unflushed local count
    pub fn number_of_used_buckets(&self) -> usize {
        let local: usize =
            self.local_counts.iter().map(|count| count.load(Ordering::Acquire)).sum();
        self.used.load(Ordering::Acquire) + local
    }

    pub fn resize_failed(&self) -> bool {
        self.resize_failed.load(Ordering::Acquire)
    }

    /// Number of resizes started since initialization
    pub fn resize_count(&self) -> usize {
        self.resize.resize_count.load(Ordering::Relaxed)
    }

    /// Number of resize chunks rehashed since initialization
    pub fn chunks_rehashed(&self) -> usize {
        self.resize.chunks_rehashed.load(Ordering::Relaxed)
    }

    /// Bytes committed for the live bucket array
    pub fn bucket_bytes(&self) -> usize {
        self.read_table().number_of_buckets * std::mem::size_of::<P::Bucket>()
    }

    /// Write the index.
    ///
    /// A pending resize is completed first. Must not run concurrently with inserts.
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        let table = self.read_table();
        if self.resize.is_in_progress() {
            self.help_resize(&table);
        }
        write_tag(writer, TAG)?;
        write_usize(writer, table.number_of_buckets)?;
        write_usize(writer, table.resize_threshold)?;
        write_bool(writer, self.resize_failed())?;
        write_usize(writer, self.used.load(Ordering::Acquire))?;
        write_usize(writer, self.local_counts.len())?;
        for count in self.local_counts.iter() {
            write_usize(writer, count.load(Ordering::Acquire))?;
        }
        table.current.save(writer)
    }

    /// Replace the contents with an index written by `save`.
    ///
    /// Local counts beyond this index's thread count are added to the global count.
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        check_tag(reader, TAG)?;
        let number_of_buckets = read_usize(reader)?;
        let resize_threshold = read_usize(reader)?;
        let resize_failed = read_bool(reader)?;
        let mut used = read_usize(reader)?;
        let threads_in_file = read_usize(reader)?;
        // Zero buckets is an index that was never initialized
        if number_of_buckets != 0 && !number_of_buckets.is_power_of_two() {
            return Err(StoreError::serialization(
                TAG,
                "load",
                format!("Bucket count {number_of_buckets} is not a power of two"),
            ));
        }
        let thread_count = self.local_counts.len();
        for slot in 0..threads_in_file {
            let count = read_usize(reader)?;
            if slot < thread_count {
                *self.local_counts[slot].get_mut() = count;
            } else {
                used += count;
            }
        }
        for slot in threads_in_file..thread_count {
            *self.local_counts[slot].get_mut() = 0;
        }

        let budget = self.budget.clone();
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.current.load(reader)?;
        if table.current.end_index() < number_of_buckets {
            return Err(StoreError::serialization(
                TAG,
                "load",
                "Bucket array is shorter than the recorded bucket count",
            ));
        }
        table.number_of_buckets = number_of_buckets;
        table.resize_threshold = resize_threshold;
        table.retiring = GrowableArena::new(budget, 0);
        table.retiring_buckets = 0;

        *self.used.get_mut() = used;
        *self.resize_failed.get_mut() = resize_failed;
        self.reset_resize_progress();
        self.initialize_counter_window(number_of_buckets, resize_threshold);
        debug!(number_of_buckets, used, "Loaded parallel hash index");
        Ok(())
    }

    fn read_table(&self) -> ShardedLockReadGuard<'_, Table<P::Bucket>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> ShardedLockWriteGuard<'_, Table<P::Bucket>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_count(&self) -> &AtomicUsize {
        &self.local_counts[thread_slot() % self.local_counts.len()]
    }

    fn initialize_counter_window(&self, number_of_buckets: usize, resize_threshold: usize) {
        let threads = self.local_counts.len();
        let window = (WINDOW_FACTOR * number_of_buckets as f64 / threads as f64) as usize;
        self.counter_window.store(window, Ordering::Release);
        self.threshold_minus_safety.store(
            resize_threshold.saturating_sub(window * (threads - 1)),
            Ordering::Release,
        );
    }

    fn reset_resize_progress(&mut self) {
        *self.resize.chunks.get_mut() = 0;
        *self.resize.next_chunk.get_mut() = 0;
        *self.resize.chunks_to_finish.get_mut() = 0;
    }

    fn resize_needed(&self) -> bool {
        self.used.load(Ordering::Acquire) + self.local_count().load(Ordering::Acquire)
            > self.threshold_minus_safety.load(Ordering::Acquire)
    }

    /// Swap in a doubled bucket array and schedule the old one for rehashing.
    ///
    /// The caller must not hold the shared lock.
    fn start_resize(&self) {
        let mut table = self.write_table();
        if self.resize.is_in_progress() || self.resize_failed() || !self.resize_needed() {
            return;
        }
        // Whatever the previous resize left mapped can go now
        table.retiring = GrowableArena::new(self.budget.clone(), 0);
        table.retiring_buckets = 0;

        let old_number_of_buckets = table.number_of_buckets;
        let new_number_of_buckets = old_number_of_buckets * 2;
        let mut new_buckets = GrowableArena::new(self.budget.clone(), 0);
        if !allocate_buckets(&mut new_buckets, new_number_of_buckets) {
            self.resize_failed.store(true, Ordering::Release);
            warn!(
                number_of_buckets = old_number_of_buckets,
                used = self.number_of_used_buckets(),
                "Parallel hash index resize failed; continuing in the current table"
            );
            return;
        }

        table.retiring = std::mem::replace(&mut table.current, new_buckets);
        table.retiring_buckets = old_number_of_buckets;
        table.number_of_buckets = new_number_of_buckets;
        table.resize_threshold = (new_number_of_buckets as f64 * self.load_factor) as usize;
        self.initialize_counter_window(new_number_of_buckets, table.resize_threshold);

        let chunks = old_number_of_buckets.div_ceil(RESIZE_CHUNK_SIZE);
        self.resize.next_chunk.store(0, Ordering::Release);
        self.resize.chunks_to_finish.store(chunks, Ordering::Release);
        self.resize.chunks.store(chunks, Ordering::Release);
        self.resize.resize_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            old_number_of_buckets,
            new_number_of_buckets, chunks, "Started parallel hash index resize"
        );
    }

    /// Rehash unclaimed chunks, then wait until every chunk is done
    fn help_resize(&self, table: &Table<P::Bucket>) {
        let chunks = self.resize.chunks.load(Ordering::Acquire);
        let mut finished_last = false;
        loop {
            let chunk = self.resize.next_chunk.fetch_add(1, Ordering::AcqRel);
            if chunk >= chunks {
                break;
            }
            let from = chunk * RESIZE_CHUNK_SIZE;
            let to = (from + RESIZE_CHUNK_SIZE).min(table.retiring_buckets);
            rehash_range(
                &self.policy,
                &table.retiring,
                from,
                to,
                &table.current,
                table.number_of_buckets,
            );
            self.resize.chunks_rehashed.fetch_add(1, Ordering::Relaxed);
            if self.resize.chunks_to_finish.fetch_sub(1, Ordering::AcqRel) == 1 {
                finished_last = true;
            }
        }

        if finished_last {
            table.retiring.ensure_begin_at_least(table.retiring.end_index());
            self.resize.chunks.store(0, Ordering::Release);
            debug!(number_of_buckets = table.number_of_buckets, "Finished parallel hash index resize");
        } else {
            let backoff = Backoff::new();
            while self.resize.is_in_progress() {
                backoff.snooze();
            }
        }
    }
}

fn new_local_counts(thread_count: usize) -> Box<[CachePadded<AtomicUsize>]> {
    (0..thread_count.max(1)).map(|_| CachePadded::new(AtomicUsize::new(0))).collect()
}

/// Shared-lock session on one key of a `ParallelHashIndex`
pub struct BucketDescriptor<'a, P: BucketPolicy> {
    index: &'a ParallelHashIndex<P>,
    guard: Option<ShardedLockReadGuard<'a, Table<P::Bucket>>>,
    cursor: BucketCursor<P::Contents>,
}

impl<'a, P: BucketPolicy> BucketDescriptor<'a, P> {
    /// Probe for `key`, helping with or starting a resize when one is due.
    ///
    /// `Empty` leaves the descriptor on a free bucket the caller may claim; calling
    /// again after a lost claim re-reads the same bucket. `NotContains` means the
    /// table is full and could not grow.
    pub fn continue_bucket_search(&mut self, key: &P::Key) -> BucketStatus {
        let index = self.index;
        loop {
            if index.resize.is_in_progress() {
                if let Some(table) = self.guard.as_deref() {
                    index.help_resize(table);
                }
                self.cursor.restart();
            }
            if index.resize_needed() && !index.resize_failed() {
                self.guard = None;
                index.start_resize();
                self.guard = Some(index.read_table());
                self.cursor.restart();
                continue;
            }
            let Some(table) = self.guard.as_deref() else {
                return BucketStatus::NotContains;
            };
            if table.number_of_buckets == 0 {
                return BucketStatus::NotContains;
            }
            return probe(&index.policy, &table.current, table.number_of_buckets, &mut self.cursor, key);
        }
    }

    /// Bucket the last search stopped at
    pub fn bucket(&self) -> Option<&P::Bucket> {
        let table = self.guard.as_deref()?;
        self.cursor.position.map(|position| &table.current[position])
    }

    /// Bucket an `Empty` search stopped at.
    ///
    /// A search that reported `Empty` always leaves the cursor on a bucket, so a missing
    /// one is an internal error attributed to `component`.
    pub fn empty_bucket(&self, component: &str) -> StoreResult<&P::Bucket> {
        self.bucket().ok_or_else(|| {
            StoreError::internal_component(component, "Empty bucket search left no bucket to claim")
        })
    }

    pub fn contents(&self) -> Option<P::Contents> {
        self.cursor.contents
    }

    pub fn hash(&self) -> usize {
        self.cursor.hash
    }

    pub fn index(&self) -> &'a ParallelHashIndex<P> {
        self.index
    }

    pub fn acknowledge_insert(&self) {
        self.index.acknowledge_insert();
    }

    /// Release the shared lock
    pub fn release(self) {}
}
