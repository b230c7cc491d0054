//! Error types for the Doclens cache and learning loop
//!
//! This module provides structured error definitions using thiserror.
//! Corruption found in stored payloads is reported here but is routed to the
//! healing layer by callers; it never aborts a read path on its own.

use thiserror::Error;

/// Main error type for Doclens operations
#[derive(Error, Debug)]
pub enum DoclensError {
    /// Persistent medium unreachable or broken at the storage-engine level
    #[error("Storage error: {0}")]
    Storage(String),

    /// Candidate rule batch rejected; every violation is listed
    #[error("Rule validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A stored payload failed to parse
    #[error("Corruption detected in {what}: {reason}")]
    Corruption { what: String, reason: String },

    /// Cache key failed sanitization
    #[error("Invalid cache key: {0}")]
    InvalidCacheKey(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pair already has an active experiment
    #[error("An experiment is already active for {framework}:{operation}")]
    ExperimentActive { framework: String, operation: String },

    /// A learning cycle is already in flight
    #[error("Learning cycle is already running")]
    AlreadyRunning,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl DoclensError {
    pub fn corruption(what: impl Into<String>, reason: impl Into<String>) -> Self {
        DoclensError::Corruption {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// True for payload-level corruption that the healing layer can act on
    pub fn is_corruption(&self) -> bool {
        matches!(self, DoclensError::Corruption { .. })
    }
}

/// Result type alias for Doclens operations
pub type Result<T> = std::result::Result<T, DoclensError>;

impl From<rusqlite::Error> for DoclensError {
    fn from(err: rusqlite::Error) -> Self {
        DoclensError::Storage(err.to_string())
    }
}

/// Convert anyhow::Error to DoclensError
impl From<anyhow::Error> for DoclensError {
    fn from(err: anyhow::Error) -> Self {
        DoclensError::Other(err.to_string())
    }
}
