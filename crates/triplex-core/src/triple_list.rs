//! Interface to the append-only record store the indexes thread their chains through

use triplex_types::{ResourceComponent, ResourceId, TupleIndex, TupleStatus};

/// Append-only store of triples addressed by tuple index.
///
/// Each triple owns one `next` link per component. The indexes only read resource
/// identifiers and statuses and rewrite links; they never create or remove records.
pub trait TripleRecordStore: Send + Sync {
    fn resource_ids(&self, tuple_index: TupleIndex) -> [ResourceId; 3];

    fn resource_id(&self, tuple_index: TupleIndex, component: ResourceComponent) -> ResourceId {
        self.resource_ids(tuple_index)[component.position()]
    }

    fn next(&self, tuple_index: TupleIndex, component: ResourceComponent) -> TupleIndex;

    fn set_next(&self, tuple_index: TupleIndex, component: ResourceComponent, next: TupleIndex);

    /// Replace the link only if it still equals `expected`
    fn set_next_conditional(
        &self,
        tuple_index: TupleIndex,
        component: ResourceComponent,
        expected: TupleIndex,
        next: TupleIndex,
    ) -> bool;

    fn triple_status(&self, tuple_index: TupleIndex) -> TupleStatus;

    /// Number of triples whose status satisfies `status & mask == value`
    fn exact_triple_count(&self, mask: TupleStatus, value: TupleStatus) -> usize;

    /// First tuple index not yet allocated
    fn first_free_tuple_index(&self) -> TupleIndex;
}
