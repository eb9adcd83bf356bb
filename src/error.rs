//! Error types for the burst buffer operator
//!
//! Provides structured error types for all operator components including
//! the registry, allocator, volume lifecycle, and host agents.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Version conflict on key: {key}")]
    Conflict { key: String },

    #[error("Keystore error: {0}")]
    Keystore(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Invalid state for operation: volume {volume} is {state}")]
    InvalidState { volume: String, state: String },

    #[error("Volume {volume} entered the error state: {reason}")]
    VolumeErrored { volume: String, reason: String },

    #[error("Attachment failed for volume {volume} on {hostname}: {reason}")]
    AttachmentFailed {
        volume: String,
        hostname: String,
        reason: String,
    },

    #[error("Delete raced with allocation for volume: {volume}")]
    Race { volume: String },

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Unable to get {requested} host-disjoint bricks from pool {pool}")]
    Unsatisfiable { pool: String, requested: usize },

    // =========================================================================
    // Runner Errors
    // =========================================================================
    #[error("Command failed on {hostname}: {output}")]
    CommandFailed { hostname: String, output: String },

    #[error("Command timed out on {hostname}: {command}")]
    Timeout { hostname: String, command: String },

    // =========================================================================
    // Client Errors
    // =========================================================================
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Key-absent constructor used throughout the registry layer
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Version-mismatch constructor used by compare-and-swap writers
    pub fn conflict(key: impl Into<String>) -> Self {
        Error::Conflict { key: key.into() }
    }

    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::Keystore(_) | Error::Timeout { .. }
        )
    }

    /// Check if this error is a transient registry race rather than a
    /// real failure
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_retryable() {
        let err = Error::conflict("/volumes/vol1/record");
        assert!(err.is_retryable());
        assert!(err.is_transient());
    }

    #[test]
    fn test_unsatisfiable_not_retryable() {
        let err = Error::Unsatisfiable {
            pool: "pool1".into(),
            requested: 3,
        };
        assert!(!err.is_retryable());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("/hosts/h1/info");
        assert_eq!(err.to_string(), "Key not found: /hosts/h1/info");
    }

    #[test]
    fn test_timeout_retryable_but_not_transient() {
        let err = Error::Timeout {
            hostname: "c1".into(),
            command: "mount".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_transient());
    }
}
