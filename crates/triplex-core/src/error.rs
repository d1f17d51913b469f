//! Error handling for the triplex storage core
//!
//! Index operations on the hot path report resource exhaustion as a plain `false`.
//! The types here are used where such a failure is escalated, and for persistence,
//! configuration and contract violations that must carry a descriptive message.

use std::fmt;
use thiserror::Error;

/// Error type for triplex storage operations
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Address-space reservation, page commit or memory budget denial
    #[error("Memory error: {message}")]
    Memory {
        message: String,
        component: Option<String>,
        requested_bytes: Option<usize>,
        available_bytes: Option<usize>,
    },

    /// A triple could not be stored because an index is out of room
    #[error("Capacity error: {message}")]
    Capacity { message: String, component: Option<String>, resource_id: Option<u64> },

    /// Persistence format errors: missing or mismatched tags, truncated streams
    #[error("Serialization error: {message}")]
    Serialization { message: String, data_type: Option<String>, operation: Option<String> },

    /// Configuration and initialization errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        setting: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// I/O failures while reading or writing persisted structures
    #[error("I/O error: {message}")]
    Io { message: String, operation: Option<String> },

    /// Protocol violations that indicate a bug in the caller or the core
    #[error("Internal error: {message}")]
    Internal { message: String, component: Option<String>, source_details: Option<String> },
}

impl StoreError {
    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            StoreError::Memory { .. } => "memory",
            StoreError::Capacity { .. } => "capacity",
            StoreError::Serialization { .. } => "serialization",
            StoreError::Configuration { .. } => "configuration",
            StoreError::Io { .. } => "io",
            StoreError::Internal { .. } => "internal",
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StoreError::Memory { .. } => ErrorSeverity::Critical,
            StoreError::Capacity { .. } => ErrorSeverity::High,
            StoreError::Serialization { .. } => ErrorSeverity::Medium,
            StoreError::Configuration { .. } => ErrorSeverity::Critical,
            StoreError::Io { .. } => ErrorSeverity::Medium,
            StoreError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Capacity errors are recoverable by the caller (for example by compacting and
    /// retrying once); the core itself never retries.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Memory { .. } => false,
            StoreError::Capacity { .. } => true,
            StoreError::Serialization { .. } => false, // Load is aborted as a whole
            StoreError::Configuration { .. } => false,
            StoreError::Io { .. } => true,
            StoreError::Internal { .. } => false,
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience constructors for common error scenarios
impl StoreError {
    /// Create a memory allocation error
    pub fn memory_allocation(
        component: &str,
        requested: usize,
        available: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Memory {
            message: message.into(),
            component: Some(component.to_string()),
            requested_bytes: Some(requested),
            available_bytes: Some(available),
        }
    }

    /// Create a capacity error for an index that could not take another triple
    pub fn capacity(component: &str, message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
            component: Some(component.to_string()),
            resource_id: None,
        }
    }

    /// Create a capacity error naming the resource that could not be indexed
    pub fn capacity_for_resource(
        component: &str,
        resource_id: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::Capacity {
            message: message.into(),
            component: Some(component.to_string()),
            resource_id: Some(resource_id),
        }
    }

    /// Create a serialization error
    pub fn serialization(data_type: &str, operation: &str, message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            data_type: Some(data_type.to_string()),
            operation: Some(operation.to_string()),
        }
    }

    /// Create the error raised when a persisted structure does not start with its tag
    pub fn invalid_tag(expected: &str, found: &str) -> Self {
        Self::serialization(
            expected,
            "load",
            format!("Invalid input: cannot load {expected} (found tag '{found}')"),
        )
    }

    /// Create a configuration error
    pub fn configuration(
        setting: &str,
        expected: &str,
        actual: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            setting: Some(setting.to_string()),
            expected: Some(expected.to_string()),
            actual: Some(actual.to_string()),
        }
    }

    /// Create an internal error with component context
    pub fn internal_component(component: &str, message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            component: Some(component.to_string()),
            source_details: None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return StoreError::serialization(
                "stream",
                "load",
                format!("Input ended before the structure was complete: {err}"),
            );
        }
        StoreError::Io { message: format!("I/O error: {err}"), operation: None }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => io.into(),
            other => StoreError::serialization("bincode", "load", format!("Invalid encoding: {other}")),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::serialization(
            "json",
            if err.is_syntax() {
                "parse"
            } else if err.is_data() {
                "validate"
            } else {
                "unknown"
            },
            format!("JSON error: {err}"),
        )
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Configuration {
            message: format!("Invalid configuration file: {err}"),
            setting: None,
            expected: None,
            actual: None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Name the component that produced a memory, capacity or internal error
    fn with_component_context(self, component: &str) -> StoreResult<T>;

    /// Add operation context to serialization and I/O errors
    fn with_operation_context(self, operation: &str) -> StoreResult<T>;
}

impl<T> ResultExt<T> for StoreResult<T> {
    fn with_component_context(self, component: &str) -> StoreResult<T> {
        self.map_err(|mut err| {
            match &mut err {
                StoreError::Memory { component: c, .. }
                | StoreError::Capacity { component: c, .. }
                | StoreError::Internal { component: c, .. } => {
                    *c = Some(component.to_string());
                }
                _ => {}
            }
            err
        })
    }

    fn with_operation_context(self, operation: &str) -> StoreResult<T> {
        self.map_err(|mut err| {
            match &mut err {
                StoreError::Serialization { operation: op, .. }
                | StoreError::Io { operation: op, .. } => {
                    *op = Some(operation.to_string());
                }
                _ => {}
            }
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_stream_is_a_format_error() {
        let err: StoreError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read").into();
        assert_eq!(err.category(), "serialization");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_component_context_only_touches_owning_variants() {
        let result: StoreResult<()> = Err(StoreError::capacity("arena", "full"));
        match result.with_component_context("OneKeyIndex") {
            Err(StoreError::Capacity { component, .. }) => {
                assert_eq!(component.as_deref(), Some("OneKeyIndex"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let result: StoreResult<()> = Err(StoreError::invalid_tag("OneKeyIndex", "Other"));
        match result.with_component_context("ignored") {
            Err(StoreError::Serialization { data_type, .. }) => {
                assert_eq!(data_type.as_deref(), Some("OneKeyIndex"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_bincode_errors_map_by_kind() {
        let eof = bincode::deserialize_from::<_, u64>(&[1u8, 2][..]).unwrap_err();
        assert_eq!(StoreError::from(eof).category(), "serialization");

        let invalid = bincode::deserialize_from::<_, bool>(&[9u8][..]).unwrap_err();
        let err = StoreError::from(invalid);
        assert_eq!(err.category(), "serialization");
        assert!(err.to_string().contains("Invalid encoding"));
    }

    #[test]
    fn test_internal_component_is_critical() {
        let err = StoreError::internal_component("ThreeKeysIndex", "bucket vanished");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_invalid_tag_message_names_structure() {
        let err = StoreError::invalid_tag("ThreeKeysIndex", "OneKeyIndex");
        assert!(err.to_string().contains("cannot load ThreeKeysIndex"));
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }
}
