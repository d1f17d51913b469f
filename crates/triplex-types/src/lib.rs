//! Triplex Types
//!
//! This crate defines the identifiers, sentinels and component selectors shared by
//! every index in the triplex storage engine. Keeping them here lets the storage core
//! and its callers agree on the encoding without depending on each other.

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::cargo)]
#![deny(missing_docs)]

mod types;
pub use types::{
    GROUPED_MASK, INVALID_RESOURCE_ID, INVALID_TUPLE_INDEX, IN_INSERTION_TUPLE_INDEX,
    NOT_GROUPED_MASK, ResourceComponent, ResourceId, TupleIndex, TupleStatus, tuple_status,
};
