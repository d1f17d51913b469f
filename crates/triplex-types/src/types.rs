use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Interned handle for a term. Zero never names a real resource.
pub type ResourceId = u64;

/// Position of a stored triple in the append-only record store.
pub type TupleIndex = u64;

/// Bit set describing the lifecycle state of a stored triple.
pub type TupleStatus = u8;

/// Resource identifier that never names a real term
pub const INVALID_RESOURCE_ID: ResourceId = 0;

/// Tuple index meaning "no triple" (empty bucket, end of chain)
pub const INVALID_TUPLE_INDEX: TupleIndex = 0;

/// Tuple index parked in a bucket while its owner finishes appending the triple
pub const IN_INSERTION_TUPLE_INDEX: TupleIndex = TupleIndex::MAX;

/// Scan hint: the chain starting at the returned head is grouped on the compared component
pub const GROUPED_MASK: TupleIndex = 0;

/// Scan hint: the chain starting at the returned head must be fully filtered
pub const NOT_GROUPED_MASK: TupleIndex = TupleIndex::MAX;

/// Tuple status bits as written by the record store
pub mod tuple_status {
    use super::TupleStatus;

    /// No status recorded yet
    pub const INVALID: TupleStatus = 0x00;
    /// Explicit triple scheduled for deletion
    pub const EDB_DEL: TupleStatus = 0x04;
    /// Explicit triple scheduled for insertion
    pub const EDB_INS: TupleStatus = 0x08;
    /// Explicitly asserted triple
    pub const EDB: TupleStatus = 0x10;
    /// Derived triple
    pub const IDB: TupleStatus = 0x20;
    /// Derived triple merged away by equality reasoning
    pub const IDB_MERGED: TupleStatus = 0x40;
    /// All fields of the triple have been written
    pub const COMPLETE: TupleStatus = 0x80;
}

/// Position of a resource inside a triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceComponent {
    /// Subject
    S,
    /// Predicate
    P,
    /// Object
    O,
}

impl ResourceComponent {
    /// All components in triple order
    pub const ALL: [Self; 3] = [Self::S, Self::P, Self::O];

    /// Zero-based offset of the component within a triple
    #[must_use]
    pub const fn position(self) -> usize {
        match self {
            Self::S => 0,
            Self::P => 1,
            Self::O => 2,
        }
    }

    /// Single-letter name used in persistence tags and reports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::S => "S",
            Self::P => "P",
            Self::O => "O",
        }
    }

    /// Selects this component's value from a triple
    #[must_use]
    pub const fn of(self, triple: [ResourceId; 3]) -> ResourceId {
        triple[self.position()]
    }

    /// The component that is neither `self` nor `other`.
    ///
    /// Returns `self` when both arguments are equal, since no unique third component exists.
    #[must_use]
    pub const fn remaining(self, other: Self) -> Self {
        match (self, other) {
            (Self::S, Self::P) | (Self::P, Self::S) => Self::O,
            (Self::S, Self::O) | (Self::O, Self::S) => Self::P,
            (Self::P, Self::O) | (Self::O, Self::P) => Self::S,
            _ => self,
        }
    }
}

impl fmt::Display for ResourceComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<usize> for ResourceComponent {
    type Error = String;

    fn try_from(position: usize) -> Result<Self, Self::Error> {
        match position {
            0 => Ok(Self::S),
            1 => Ok(Self::P),
            2 => Ok(Self::O),
            other => Err(format!("triple component position out of range: {other}")),
        }
    }
}
