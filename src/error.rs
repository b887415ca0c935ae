//! Error types for the tiered message store

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-checkable error category.
///
/// Callers match on the code instead of parsing messages. The string form is
/// stable and safe to put into logs and administrative replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Entry-count limit of a tier was hit
    ResourceOverflowEntries,
    /// Byte limit of a tier was hit
    ResourceOverflowBytes,
    /// Durable tier missing or disconnected when it was needed
    ResourceDbUnavailable,
    /// Storage is down or not yet initialized
    ResourceUnavailable,
    /// Invalid configuration
    ResourceConfiguration,
    /// Tier I/O failure
    ResourceIo,
    /// Precondition violated by the caller
    InternalIllegalArgument,
    /// Operation not supported by this storage
    InternalNotImplemented,
    /// Anything else
    InternalUnknown,
}

impl ErrorCode {
    /// Dotted code name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ResourceOverflowEntries => "resource.overflow.queue.entries",
            ErrorCode::ResourceOverflowBytes => "resource.overflow.queue.bytes",
            ErrorCode::ResourceDbUnavailable => "resource.db.unavailable",
            ErrorCode::ResourceUnavailable => "resource.unavailable",
            ErrorCode::ResourceConfiguration => "resource.configuration",
            ErrorCode::ResourceIo => "resource.io",
            ErrorCode::InternalIllegalArgument => "internal.illegalArgument",
            ErrorCode::InternalNotImplemented => "internal.notImplemented",
            ErrorCode::InternalUnknown => "internal.unknown",
        }
    }

    /// True for both overflow codes
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            ErrorCode::ResourceOverflowEntries | ErrorCode::ResourceOverflowBytes
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the tiered message store
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Entry-count limit exceeded
    #[error("[{location}] Storage overflow (number of entries) in '{storage_id}': {num_entries} entries stored, max is {max_entries}")]
    OverflowEntries {
        storage_id: String,
        location: String,
        num_entries: u64,
        max_entries: u64,
    },

    /// Byte limit exceeded
    #[error("[{location}] Storage overflow (bytes) in '{storage_id}': {num_bytes} bytes stored, entry needs {entry_bytes}, max is {max_bytes}")]
    OverflowBytes {
        storage_id: String,
        location: String,
        num_bytes: u64,
        entry_bytes: u64,
        max_bytes: u64,
    },

    // =========================================================================
    // Availability Errors
    // =========================================================================
    /// Durable tier is not configured or currently disconnected
    #[error("[{location}] Durable store unavailable for '{storage_id}': {reason}")]
    DurableUnavailable {
        storage_id: String,
        location: String,
        reason: String,
    },

    /// Storage is down or was never initialized
    #[error("[{location}] Storage '{storage_id}' is not available: {reason}")]
    ResourceUnavailable {
        storage_id: String,
        location: String,
        reason: String,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Precondition violated
    #[error("[{location}] Illegal argument: {reason}")]
    IllegalArgument { location: String, reason: String },

    /// Operation is not supported
    #[error("[{location}] {operation} is not implemented")]
    NotImplemented {
        location: String,
        operation: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Tier I/O Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::OverflowEntries { .. } => ErrorCode::ResourceOverflowEntries,
            Error::OverflowBytes { .. } => ErrorCode::ResourceOverflowBytes,
            Error::DurableUnavailable { .. } => ErrorCode::ResourceDbUnavailable,
            Error::ResourceUnavailable { .. } => ErrorCode::ResourceUnavailable,
            Error::IllegalArgument { .. } => ErrorCode::InternalIllegalArgument,
            Error::NotImplemented { .. } => ErrorCode::InternalNotImplemented,
            Error::Config(_) | Error::Yaml(_) => ErrorCode::ResourceConfiguration,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::CompressionFailed { .. }
            | Error::DecompressionFailed { .. } => ErrorCode::ResourceIo,
            Error::Internal(_) => ErrorCode::InternalUnknown,
        }
    }

    /// Where the error was raised, if recorded
    pub fn location(&self) -> Option<&str> {
        match self {
            Error::OverflowEntries { location, .. }
            | Error::OverflowBytes { location, .. }
            | Error::DurableUnavailable { location, .. }
            | Error::ResourceUnavailable { location, .. }
            | Error::IllegalArgument { location, .. }
            | Error::NotImplemented { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Convenience for `self.code().is_overflow()`
    pub fn is_overflow(&self) -> bool {
        self.code().is_overflow()
    }

    pub(crate) fn not_implemented(location: impl Into<String>, operation: &str) -> Self {
        Error::NotImplemented {
            location: location.into(),
            operation: operation.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::OverflowEntries {
            storage_id: "msgUnitStore:topic".into(),
            location: "put".into(),
            num_entries: 2,
            max_entries: 2,
        };
        assert_eq!(err.code(), ErrorCode::ResourceOverflowEntries);
        assert!(err.is_overflow());
        assert_eq!(err.location(), Some("put"));

        let err = Error::DurableUnavailable {
            storage_id: "s".into(),
            location: "swap".into(),
            reason: "disconnected".into(),
        };
        assert_eq!(err.code().as_str(), "resource.db.unavailable");
        assert!(!err.is_overflow());
    }

    #[test]
    fn test_io_error_maps_to_resource_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert_eq!(err.code(), ErrorCode::ResourceIo);
        assert!(err.location().is_none());
    }

    #[test]
    fn test_display_carries_location_and_storage() {
        let err = Error::OverflowBytes {
            storage_id: "cache:a".into(),
            location: "PersistenceCache-cache:a-put(7)".into(),
            num_bytes: 90,
            entry_bytes: 20,
            max_bytes: 100,
        };
        let text = err.to_string();
        assert!(text.contains("cache:a"));
        assert!(text.contains("put(7)"));
        assert_eq!(err.code().to_string(), "resource.overflow.queue.bytes");
    }
}
