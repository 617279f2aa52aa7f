//! Error types for the tiered cache gateway

use thiserror::Error;

use crate::cache::CacheTier;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching gateway
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Cache Engine Errors
    // =========================================================================
    /// A tier has no room for the pending write
    #[error("{tier} tier out of capacity: requested {requested} bytes, {available} available")]
    OutOfCapacity {
        tier: CacheTier,
        requested: u64,
        available: u64,
    },

    /// A write observed a newer version already present
    #[error("Stale version {version} for {bucket}/{key}: version {current} already present")]
    StaleVersion {
        bucket: String,
        key: String,
        version: i64,
        current: i64,
    },

    /// Finalizing an object against the remote store failed
    #[error("Remote commit failed for {bucket}/{key}: {reason}")]
    RemoteCommitFailure {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Remote store request failed
    #[error("Remote store error: {0}")]
    Remote(String),

    /// An internal protocol or state invariant did not hold
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Requested byte range is not valid for the object
    #[error("Invalid byte range [{start}, {stop}]")]
    InvalidRange { start: i64, stop: i64 },

    /// Operation on a write session that was already closed or aborted
    #[error("Write session for {0} is no longer open")]
    SessionClosed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the capacity error that the write path recovers from
    pub fn is_out_of_capacity(&self) -> bool {
        matches!(self, Error::OutOfCapacity { .. })
    }
}
