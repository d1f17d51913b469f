//! Indexes over two triple components
//!
//! Every triple is threaded onto the chain of its `first` component value through the
//! record store's per-component `next` links. `TwoKeysGroupIndex` keeps one chain per
//! value and answers two-key lookups by returning the chain head together with the
//! value the scan still has to match. `TwoKeysPairIndex` additionally keeps the
//! triples of each `(first, second)` pair contiguous. `TwoKeysGroupProxy` wraps a
//! group index and steers hot values to a fixed splice point.
//!
//! Chains are updated lock-free: pushing a new head is a compare-and-swap on the
//! one-key head, splicing after an existing triple is a compare-and-swap on its link.
//! The relative order of concurrently inserted triples is unspecified.

use crate::one_key_index::OneKeyIndex;
use crate::triple_list::TripleRecordStore;
use crossbeam_utils::Backoff;
use triplex_types::{INVALID_TUPLE_INDEX, ResourceComponent, ResourceId, TupleIndex};

pub mod group_by_one;
pub mod group_by_two;
pub mod proxy;

pub use group_by_one::TwoKeysGroupIndex;
pub use group_by_two::TwoKeysPairIndex;
pub use proxy::{ProxyRoute, TwoKeysGroupProxy};

/// Where a two-key scan starts and what it has to compare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStart {
    /// First triple of the chain, `INVALID_TUPLE_INDEX` when there is none
    pub head: TupleIndex,
    /// Component each visited triple must be compared on
    pub compare_component: ResourceComponent,
    pub compare_resource_id: ResourceId,
    /// `GROUPED_MASK` when matching triples form one contiguous run, else `NOT_GROUPED_MASK`
    pub grouped_mask: TupleIndex,
}

impl ChainStart {
    pub fn is_empty(&self) -> bool {
        self.head == INVALID_TUPLE_INDEX
    }
}

/// Tuple indexes along one component chain
pub struct Chain<'a, S: TripleRecordStore> {
    store: &'a S,
    component: ResourceComponent,
    current: TupleIndex,
}

impl<'a, S: TripleRecordStore> Chain<'a, S> {
    pub fn new(store: &'a S, component: ResourceComponent, head: TupleIndex) -> Self {
        Self { store, component, current: head }
    }
}

impl<S: TripleRecordStore> Iterator for Chain<'_, S> {
    type Item = TupleIndex;

    fn next(&mut self) -> Option<TupleIndex> {
        if self.current == INVALID_TUPLE_INDEX {
            return None;
        }
        let tuple_index = self.current;
        self.current = self.store.next(tuple_index, self.component);
        Some(tuple_index)
    }
}

/// Make `tuple_index` the head of `value`'s chain
pub(crate) fn push_onto_chain<S: TripleRecordStore>(
    store: &S,
    one_key: &OneKeyIndex,
    component: ResourceComponent,
    value: ResourceId,
    tuple_index: TupleIndex,
) {
    let backoff = Backoff::new();
    loop {
        let head = one_key.head(value);
        store.set_next(tuple_index, component, head);
        if one_key.set_head_conditional(value, head, tuple_index) {
            return;
        }
        backoff.spin();
    }
}

/// Link `tuple_index` directly behind `predecessor`
pub(crate) fn splice_after<S: TripleRecordStore>(
    store: &S,
    component: ResourceComponent,
    predecessor: TupleIndex,
    tuple_index: TupleIndex,
) {
    let backoff = Backoff::new();
    loop {
        let successor = store.next(predecessor, component);
        store.set_next(tuple_index, component, successor);
        if store.set_next_conditional(predecessor, component, successor, tuple_index) {
            return;
        }
        backoff.spin();
    }
}
