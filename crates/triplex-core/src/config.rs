//! Storage configuration
//!
//! Options are read once when a structure is constructed. They come from a TOML file
//! (path in `TRIPLEX_CONFIG_PATH`, default `triplex.toml`) and may be overridden by
//! `TRIPLEX_*` environment variables.

use crate::constants::{arena, hash_table, proxy};
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use tracing::{debug, info, warn};

/// Threshold that may be switched off entirely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Active at the given value
    Limit(usize),
    /// Never reached
    Unlimited,
}

impl Threshold {
    /// True when `value` has reached an active limit
    pub fn is_reached_by(self, value: usize) -> bool {
        match self {
            Threshold::Limit(limit) => value >= limit,
            Threshold::Unlimited => false,
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, Threshold::Unlimited)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Limit(limit) => write!(f, "{limit}"),
            Threshold::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl std::str::FromStr for Threshold {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(Threshold::Unlimited);
        }
        trimmed.parse::<usize>().map(Threshold::Limit).map_err(|_| {
            StoreError::configuration(
                "proxyHashTableThreshold",
                "a non-negative integer or \"unlimited\"",
                trimmed,
                "Invalid threshold value",
            )
        })
    }
}

impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Threshold::Limit(limit) => serializer.serialize_u64(*limit as u64),
            Threshold::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(limit) => Ok(Threshold::Limit(limit as usize)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for every index in a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Grouping values below this use the dense proxy array (0 disables the array)
    #[serde(default = "default_proxy_array_threshold")]
    pub proxy_array_threshold: u64,
    /// Chain length from which a dedicated proxy hash entry is used
    #[serde(default = "default_proxy_hash_table_threshold")]
    pub proxy_hash_table_threshold: Threshold,
    #[serde(default = "default_load_factor")]
    pub hash_table_load_factor: f64,
    /// Bucket count of a freshly initialized hash index; must be a power of two
    #[serde(default = "default_initial_bucket_count")]
    pub initial_bucket_count: usize,
    /// Number of local insertion counters kept by parallel hash indexes
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Process-wide ceiling on committed index memory; `None` means unlimited
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
    /// Reservation size for arenas that are indexed by resource identifier
    #[serde(default = "default_large_region_bytes")]
    pub large_region_bytes: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            proxy_array_threshold: default_proxy_array_threshold(),
            proxy_hash_table_threshold: default_proxy_hash_table_threshold(),
            hash_table_load_factor: default_load_factor(),
            initial_bucket_count: default_initial_bucket_count(),
            thread_count: default_thread_count(),
            memory_limit_bytes: None,
            large_region_bytes: default_large_region_bytes(),
            page_size: default_page_size(),
            log_format: LogFormat::default(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from the file named by `TRIPLEX_CONFIG_PATH`.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> StoreResult<Self> {
        let config_path =
            std::env::var("TRIPLEX_CONFIG_PATH").unwrap_or_else(|_| "triplex.toml".to_string());

        match fs::read_to_string(&config_path) {
            Ok(contents) => {
                debug!(path = %config_path, "Loading storage configuration");
                Self::from_toml_str(&contents)
            }
            Err(_) => {
                warn!(
                    "Configuration file '{}' not found. Using default storage configuration.",
                    config_path
                );
                Ok(Self::default())
            }
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        let config: StorageConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRIPLEX_*` environment variable overrides and re-validate
    pub fn apply_env_overrides(mut self) -> StoreResult<Self> {
        if let Ok(value) = std::env::var("TRIPLEX_PROXY_ARRAY_THRESHOLD") {
            self.proxy_array_threshold = parse_env("TRIPLEX_PROXY_ARRAY_THRESHOLD", &value)?;
        }
        if let Ok(value) = std::env::var("TRIPLEX_PROXY_HASH_TABLE_THRESHOLD") {
            self.proxy_hash_table_threshold = value.parse()?;
        }
        if let Ok(value) = std::env::var("TRIPLEX_THREAD_COUNT") {
            self.thread_count = parse_env("TRIPLEX_THREAD_COUNT", &value)?;
        }
        if let Ok(value) = std::env::var("TRIPLEX_MEMORY_LIMIT_BYTES") {
            self.memory_limit_bytes = Some(parse_env("TRIPLEX_MEMORY_LIMIT_BYTES", &value)?);
        }
        if let Ok(value) = std::env::var("TRIPLEX_INITIAL_BUCKET_COUNT") {
            self.initial_bucket_count = parse_env("TRIPLEX_INITIAL_BUCKET_COUNT", &value)?;
        }

        info!(
            proxy_array_threshold = self.proxy_array_threshold,
            proxy_hash_table_threshold = %self.proxy_hash_table_threshold,
            thread_count = self.thread_count,
            "Applied storage configuration overrides"
        );
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the indexes cannot work with
    pub fn validate(&self) -> StoreResult<()> {
        if !self.initial_bucket_count.is_power_of_two() {
            return Err(StoreError::configuration(
                "initialBucketCount",
                "a power of two",
                &self.initial_bucket_count.to_string(),
                "Hash index bucket count must be a power of two",
            ));
        }
        if !(self.hash_table_load_factor > 0.0 && self.hash_table_load_factor < 1.0) {
            return Err(StoreError::configuration(
                "hashTableLoadFactor",
                "a value in (0, 1)",
                &self.hash_table_load_factor.to_string(),
                "Load factor out of range",
            ));
        }
        if self.thread_count == 0 {
            return Err(StoreError::configuration(
                "threadCount",
                "at least 1",
                "0",
                "At least one thread must be configured",
            ));
        }
        if !self.page_size.is_power_of_two() {
            return Err(StoreError::configuration(
                "pageSize",
                "a power of two",
                &self.page_size.to_string(),
                "Page size must be a power of two",
            ));
        }
        Ok(())
    }

    /// Smallest power-of-two bucket count that holds `number_of_entries` below the load factor
    pub fn hash_table_size(&self, number_of_entries: usize) -> usize {
        let with_load_factor =
            (number_of_entries as f64 / self.hash_table_load_factor) as usize + 1;
        with_load_factor.next_power_of_two().max(self.initial_bucket_count)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> StoreResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        StoreError::configuration(name, "a non-negative integer", value, "Invalid override")
    })
}

fn default_proxy_array_threshold() -> u64 {
    proxy::DEFAULT_ARRAY_THRESHOLD
}
fn default_proxy_hash_table_threshold() -> Threshold {
    Threshold::Limit(proxy::DEFAULT_HASH_TABLE_THRESHOLD)
}
fn default_load_factor() -> f64 {
    hash_table::LOAD_FACTOR
}
fn default_initial_bucket_count() -> usize {
    hash_table::INITIAL_SIZE
}
fn default_thread_count() -> usize {
    num_cpus::get().max(1)
}
fn default_page_size() -> usize {
    arena::DEFAULT_PAGE_SIZE
}

/// Half of physical memory, clamped; falls back to the lower bound when unknown
fn default_large_region_bytes() -> usize {
    match sys_info::mem_info() {
        Ok(info) => ((info.total as usize).saturating_mul(1024) / 2)
            .clamp(arena::MIN_LARGE_REGION_BYTES, arena::MAX_LARGE_REGION_BYTES),
        Err(_) => arena::MIN_LARGE_REGION_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = StorageConfig::default();
        assert_eq!(config.proxy_array_threshold, 10_000);
        assert_eq!(config.proxy_hash_table_threshold, Threshold::Limit(500));
        assert_eq!(config.initial_bucket_count, 32_768);
        assert!(config.thread_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_camel_case_toml() {
        let config = StorageConfig::from_toml_str(
            r#"
proxyArrayThreshold = 100
proxyHashTableThreshold = "unlimited"
initialBucketCount = 1024
threadCount = 4
"#,
        )
        .unwrap();

        assert_eq!(config.proxy_array_threshold, 100);
        assert!(config.proxy_hash_table_threshold.is_unlimited());
        assert_eq!(config.initial_bucket_count, 1024);
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.hash_table_load_factor, 0.7);
    }

    #[test]
    fn test_rejects_bucket_count_that_is_not_power_of_two() {
        let err = StorageConfig::from_toml_str("initialBucketCount = 1000").unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_hash_table_size() {
        let config = StorageConfig { initial_bucket_count: 1024, ..StorageConfig::default() };
        assert_eq!(config.hash_table_size(0), 1024);
        // 10_000 / 0.7 + 1 = 14_286 -> 16_384
        assert_eq!(config.hash_table_size(10_000), 16_384);
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!("250".parse::<Threshold>().unwrap(), Threshold::Limit(250));
        assert_eq!("Unlimited".parse::<Threshold>().unwrap(), Threshold::Unlimited);
        assert!("many".parse::<Threshold>().is_err());
        assert!(Threshold::Limit(3).is_reached_by(3));
        assert!(!Threshold::Unlimited.is_reached_by(usize::MAX));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("TRIPLEX_PROXY_ARRAY_THRESHOLD", "77");
            std::env::set_var("TRIPLEX_PROXY_HASH_TABLE_THRESHOLD", "unlimited");
        }

        let config = StorageConfig::default().apply_env_overrides().unwrap();

        unsafe {
            std::env::remove_var("TRIPLEX_PROXY_ARRAY_THRESHOLD");
            std::env::remove_var("TRIPLEX_PROXY_HASH_TABLE_THRESHOLD");
        }

        assert_eq!(config.proxy_array_threshold, 77);
        assert!(config.proxy_hash_table_threshold.is_unlimited());
    }

    #[test]
    #[serial]
    fn test_invalid_env_override_is_reported() {
        unsafe {
            std::env::set_var("TRIPLEX_THREAD_COUNT", "lots");
        }
        let result = StorageConfig::default().apply_env_overrides();
        unsafe {
            std::env::remove_var("TRIPLEX_THREAD_COUNT");
        }
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var("TRIPLEX_CONFIG_PATH", "/nonexistent/triplex.toml");
        }
        let config = StorageConfig::load().unwrap();
        unsafe {
            std::env::remove_var("TRIPLEX_CONFIG_PATH");
        }
        assert_eq!(config.proxy_array_threshold, 10_000);
    }
}
