/// Core constants used throughout the triplex storage engine
///
/// This module centralizes sizing and tuning numbers so that the indexes, the
/// configuration defaults and the tests agree on them.
/// Hash table sizing
pub mod hash_table {
    /// Default number of buckets for a freshly initialized hash index
    pub const INITIAL_SIZE: usize = 32_768;

    /// Fraction of buckets that may be used before a resize is triggered
    pub const LOAD_FACTOR: f64 = 0.7;
}

/// Cooperative resize of parallel hash indexes
pub mod parallel {
    /// Number of old buckets rehashed by one claim
    pub const RESIZE_CHUNK_SIZE: usize = 1024;

    /// Share of the buckets a thread may insert before flushing its local counter
    /// (divided among the configured threads)
    pub const WINDOW_FACTOR: f64 = 0.1;
}

/// Proxy thresholds for two-key grouping indexes
pub mod proxy {
    /// Grouping values below this are tracked in a dense array
    pub const DEFAULT_ARRAY_THRESHOLD: u64 = 10_000;

    /// Chain length from which a dedicated proxy hash entry is kept
    pub const DEFAULT_HASH_TABLE_THRESHOLD: usize = 500;
}

/// Arena sizing
pub mod arena {
    /// Commit granularity used when the host page size is not configured
    pub const DEFAULT_PAGE_SIZE: usize = 4096;

    /// Page multiplier power used by the one-key index arenas (8 pages per step)
    pub const ONE_KEY_INDEX_PAGE_POWER: u32 = 3;

    /// Bounds for the default large-region reservation
    pub const MIN_LARGE_REGION_BYTES: usize = 64 * 1024 * 1024;
    pub const MAX_LARGE_REGION_BYTES: usize = 16 * 1024 * 1024 * 1024;
}
