//! Growable arenas backed by reserved address space
//!
//! A `GrowableArena` reserves its whole address range once through an anonymous
//! `memmap2` mapping and then advances a committed window `[begin, end)` over it.
//! Growth never moves elements, so an index that was valid stays valid for the
//! lifetime of the reservation. Physical memory is accounted against the shared
//! `MemoryBudget` in steps of `page_size << page_multiplier_power` bytes.

use crate::error::{StoreError, StoreResult};
use crate::memory_budget::MemoryBudget;
use crate::persistence::{read_usize, write_usize};
use memmap2::{MmapMut, MmapOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Index;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Element types that may live in a `GrowableArena`.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of the type, and the type must only
/// be mutated through shared references (atomics), since the arena hands out `&T`
/// into memory that many threads access at once.
pub unsafe trait ArenaElement: Send + Sync + 'static {}

unsafe impl ArenaElement for AtomicU32 {}
unsafe impl ArenaElement for AtomicU64 {}
unsafe impl ArenaElement for AtomicUsize {}

/// Densely indexed array that grows in place.
pub struct GrowableArena<T: ArenaElement> {
    budget: Arc<MemoryBudget>,
    page_multiplier_power: u32,
    mapping: Option<MmapMut>,
    base: NonNull<T>,
    max_items: usize,
    begin: AtomicUsize,
    end: AtomicUsize,
    _marker: PhantomData<T>,
}

// The mapping is owned by the arena and elements are only mutated through atomics.
unsafe impl<T: ArenaElement> Send for GrowableArena<T> {}
unsafe impl<T: ArenaElement> Sync for GrowableArena<T> {}

impl<T: ArenaElement> GrowableArena<T> {
    /// Create an arena without a reservation; call `reserve` before use
    pub fn new(budget: Arc<MemoryBudget>, page_multiplier_power: u32) -> Self {
        Self {
            budget,
            page_multiplier_power,
            mapping: None,
            base: NonNull::dangling(),
            max_items: 0,
            begin: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Reserve address space for `max_items` elements without committing any.
    ///
    /// Any previous reservation is released first. Returns `false` if the host refuses
    /// the reservation.
    pub fn reserve(&mut self, max_items: usize) -> bool {
        self.release_reservation();
        if max_items == 0 {
            return true;
        }
        let Some(bytes) = max_items.checked_mul(size_of::<T>()) else {
            warn!(max_items, "Arena reservation size overflows the address space");
            return false;
        };
        match MmapOptions::new().len(bytes).map_anon() {
            Ok(mut mapping) => {
                let Some(base) = NonNull::new(mapping.as_mut_ptr().cast::<T>()) else {
                    return false;
                };
                self.base = base;
                self.mapping = Some(mapping);
                self.max_items = max_items;
                debug!(max_items, reserved_bytes = bytes, "Reserved arena address space");
                true
            }
            Err(err) => {
                warn!(max_items, reserved_bytes = bytes, error = %err, "Arena reservation refused");
                false
            }
        }
    }

    /// Reserve the budget's large-region size worth of elements
    pub fn reserve_large(&mut self) -> bool {
        let max_items = self.budget.large_region_size() / size_of::<T>();
        self.reserve(max_items)
    }

    /// Keep an existing reservation, otherwise reserve `max_items`
    pub fn ensure_reserved(&mut self, max_items: usize) -> bool {
        self.is_reserved() || self.reserve(max_items)
    }

    pub fn is_reserved(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn begin_index(&self) -> usize {
        self.begin.load(Ordering::Acquire)
    }

    pub fn end_index(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// True when `[index, index + size)` lies inside the committed window's end
    pub fn is_before_end(&self, index: usize, size: usize) -> bool {
        index.checked_add(size).is_some_and(|required| required <= self.end_index())
    }

    /// Bytes currently charged to the budget by this arena
    pub fn committed_bytes(&self) -> usize {
        (self.end_index() - self.begin_index()) * size_of::<T>()
    }

    /// Guarantee that elements `[0, index + size)` are committed.
    ///
    /// Safe under concurrent callers: extenders race on the end boundary with a
    /// compare-and-set and each winner charges only the range it adds.
    pub fn ensure_end_at_least(&self, index: usize, size: usize) -> bool {
        let Some(required) = index.checked_add(size) else {
            return false;
        };
        let mut current = self.end.load(Ordering::Acquire);
        if required <= current {
            return true;
        }
        if required > self.max_items {
            warn!(
                required_items = required,
                max_items = self.max_items,
                "Arena extension exceeds its reservation"
            );
            return false;
        }

        let element_size = size_of::<T>();
        let granule = self.budget.page_size() << self.page_multiplier_power;
        let target_bytes =
            (required * element_size).div_ceil(granule) * granule;
        let target = target_bytes.min(self.max_items * element_size) / element_size;

        loop {
            if current >= required {
                return true;
            }
            let added_bytes = (target - current) * element_size;
            if !self.budget.try_allocate(added_bytes) {
                return false;
            }
            match self.end.compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => {
                    self.budget.notify_deallocated(added_bytes);
                    current = observed;
                }
            }
        }
    }

    /// Advance the logical start to `index` (never past the end) and release the
    /// physical backing of whole pages before it.
    pub fn ensure_begin_at_least(&self, index: usize) {
        let mut current = self.begin.load(Ordering::Acquire);
        loop {
            let target = index.min(self.end.load(Ordering::Acquire));
            if target <= current {
                return;
            }
            match self.begin.compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.budget.notify_deallocated((target - current) * size_of::<T>());
                    self.release_pages(current, target);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Element at `index` if it is below the committed end
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.end_index() { Some(&self[index]) } else { None }
    }

    /// Write the committed window.
    ///
    /// Must not run concurrently with writers to this arena.
    pub fn save<W: Write>(&self, writer: &mut W) -> StoreResult<()> {
        let begin = self.begin_index();
        let end = self.end_index();
        write_usize(writer, size_of::<T>())?;
        write_usize(writer, begin)?;
        write_usize(writer, end)?;
        if end > begin {
            writer.write_all(self.window_bytes(begin, end))?;
        }
        Ok(())
    }

    /// Replace the contents with a window written by `save`.
    ///
    /// The reservation is kept if it covers the window. An unreserved arena is reserved
    /// for exactly the window, so owners that must grow after loading call
    /// `ensure_reserved` first.
    pub fn load<R: Read>(&mut self, reader: &mut R) -> StoreResult<()> {
        let stride = read_usize(reader)?;
        if stride != size_of::<T>() {
            return Err(StoreError::serialization(
                "GrowableArena",
                "load",
                format!("Element size {stride} does not match expected {}", size_of::<T>()),
            ));
        }
        let begin = read_usize(reader)?;
        let end = read_usize(reader)?;
        if begin > end {
            return Err(StoreError::serialization(
                "GrowableArena",
                "load",
                format!("Window start {begin} lies after its end {end}"),
            ));
        }

        let max_items = self.max_items.max(end);
        if !self.reserve(max_items) {
            return Err(StoreError::memory_allocation(
                "GrowableArena",
                max_items * size_of::<T>(),
                0,
                "Cannot reserve address space for loaded arena",
            ));
        }
        let window_bytes = (end - begin) * size_of::<T>();
        if !self.budget.try_allocate(window_bytes) {
            return Err(StoreError::memory_allocation(
                "GrowableArena",
                window_bytes,
                self.budget.limit().saturating_sub(self.budget.used_bytes()),
                "Memory budget exhausted while loading arena",
            ));
        }
        self.begin.store(begin, Ordering::Release);
        self.end.store(end, Ordering::Release);
        if window_bytes > 0 {
            let offset = begin * size_of::<T>();
            let mapping = self.mapping.as_mut().ok_or_else(|| {
                StoreError::internal_component("GrowableArena", "Reservation vanished during load")
            })?;
            reader.read_exact(&mut mapping[offset..offset + window_bytes])?;
        }
        debug!(begin, end, "Loaded arena window");
        Ok(())
    }

    fn window_bytes(&self, begin: usize, end: usize) -> &[u8] {
        let element_size = size_of::<T>();
        // SAFETY: [begin, end) lies inside the reservation and stays mapped for &self.
        unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().cast::<u8>().add(begin * element_size),
                (end - begin) * element_size,
            )
        }
    }

    fn release_pages(&self, from_item: usize, to_item: usize) {
        let page = self.budget.page_size();
        let start = (from_item * size_of::<T>()) / page * page;
        let stop = (to_item * size_of::<T>()) / page * page;
        if stop <= start {
            return;
        }
        #[cfg(unix)]
        if let Some(mapping) = self.mapping.as_ref() {
            // SAFETY: nothing reads meaningful data below `begin`; released anonymous pages
            // read back as zeros, which is a valid element value.
            let result = unsafe {
                mapping.unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, start, stop - start)
            };
            if let Err(err) = result {
                debug!(start, stop, error = %err, "Could not release arena pages");
            }
        }
    }

    fn release_reservation(&mut self) {
        let committed = self.committed_bytes();
        if committed > 0 {
            self.budget.notify_deallocated(committed);
        }
        self.mapping = None;
        self.base = NonNull::dangling();
        self.max_items = 0;
        self.begin.store(0, Ordering::Release);
        self.end.store(0, Ordering::Release);
    }
}

impl<T: ArenaElement> Index<usize> for GrowableArena<T> {
    type Output = T;

    /// Unchecked against the committed end; callers establish validity through
    /// `ensure_end_at_least` or `is_before_end`. Panics only outside the reservation.
    fn index(&self, index: usize) -> &T {
        assert!(index < self.max_items, "arena index {index} outside reservation of {}", self.max_items);
        // SAFETY: index is inside the mapping and zeroed memory is a valid T.
        unsafe { &*self.base.as_ptr().add(index) }
    }
}

impl<T: ArenaElement> Drop for GrowableArena<T> {
    fn drop(&mut self) {
        self.release_reservation();
    }
}

impl<T: ArenaElement> std::fmt::Debug for GrowableArena<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableArena")
            .field("max_items", &self.max_items)
            .field("begin", &self.begin_index())
            .field("end", &self.end_index())
            .finish()
    }
}
