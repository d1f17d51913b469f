#![deny(warnings)]
#![allow(missing_docs)]
//! Storage core of the triplex triple store.
//!
//! This crate provides the concurrent indexes that sit on top of an append-only
//! record store of (subject, predicate, object) triples: a full three-key hash index
//! that makes insertion idempotent, and two-key grouping indexes that thread every
//! triple onto per-value chains. All of them can be populated by many threads at once
//! and grow on demand inside a shared memory budget.

use tracing::{debug, instrument};

/// Memory-mapped arrays that grow in place
pub mod arena;
/// Storage configuration loaded from TOML and the environment
pub mod config;
/// Sizing and tuning constants
pub mod constants;
/// Error types
pub mod error;
/// Sequential and parallel open-addressing hash indexes
pub mod hash_index;
/// Tracing subscriber setup
pub mod logging;
/// Process-wide accounting of committed index memory
pub mod memory_budget;
/// Per-resource chain heads and triple counts
pub mod one_key_index;
/// Tagged little-endian persistence helpers
pub mod persistence;
/// Diagnostics reports
pub mod statistics;
/// Test and benchmark utilities
pub mod test_utils;
/// Index of triples by all three components
pub mod three_keys;
/// Record store interface
pub mod triple_list;
/// Indexes of triples by one or two components
pub mod two_keys;

#[cfg(test)]
mod send_sync_test;

pub use arena::GrowableArena;
pub use config::{LogFormat, StorageConfig, Threshold};
pub use error::{ErrorSeverity, ResultExt, StoreError, StoreResult};
pub use hash_index::{BucketPolicy, BucketStatus, ParallelHashIndex, SequentialHashIndex};
pub use memory_budget::MemoryBudget;
pub use one_key_index::OneKeyIndex;
pub use statistics::ComponentStatistics;
pub use three_keys::{InsertOutcome, InsertToken, ThreeKeysIndex, ThreeKeysIndexPolicy};
pub use triple_list::TripleRecordStore;
pub use two_keys::{ChainStart, ProxyRoute, TwoKeysGroupIndex, TwoKeysGroupProxy, TwoKeysPairIndex};

/// Load the storage configuration and install logging
#[instrument]
pub fn init() -> anyhow::Result<StorageConfig> {
    let config = StorageConfig::load()?.apply_env_overrides()?;
    logging::init_logging(config.log_format);
    debug!(thread_count = config.thread_count, "Initializing triplex storage core");
    Ok(config)
}
