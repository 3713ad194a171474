//! Cache operation error types
//!
//! A single error enum covers every failure the engine can surface to a
//! caller. Write-behind task failures are deliberately absent from the
//! synchronous paths: they reach the application only through the
//! out-of-band failure callback after retries exhaust.

use std::fmt;

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Capacity reservation failed and the eviction retry could not free
    /// enough space in any tier.
    AdmissionDenied {
        /// Tier that issued the final denial.
        tier: &'static str,
    },
    /// Value or key could not be encoded for a tier requiring serialization.
    SerializationError(String),
    /// Stored bytes could not be decoded back into the expected type.
    DeserializationError(String),
    /// The configured loader failed on a cache miss. Cache state unchanged.
    LoaderFailure(String),
    /// A synchronous write-through to the system of record failed. The
    /// local tiers keep the new value; the divergence is not rolled back.
    WriteThroughFailure(String),
    /// The write-behind queue is full and the configured full-queue policy
    /// rejects rather than blocks.
    WriteBehindSaturated,
    /// Filesystem failure in the disk tier.
    Io(String),
    /// Invalid build-time or runtime configuration.
    InvalidConfiguration(String),
    /// Operation attempted after `close` was initiated.
    CacheClosed,
}

impl CacheError {
    pub fn admission_denied(tier: &'static str) -> Self {
        CacheError::AdmissionDenied { tier }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        CacheError::SerializationError(msg.into())
    }

    pub fn deserialization(msg: impl Into<String>) -> Self {
        CacheError::DeserializationError(msg.into())
    }

    pub fn loader(msg: impl Into<String>) -> Self {
        CacheError::LoaderFailure(msg.into())
    }

    pub fn write_through(msg: impl Into<String>) -> Self {
        CacheError::WriteThroughFailure(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        CacheError::InvalidConfiguration(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        CacheError::Io(msg.into())
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::AdmissionDenied { tier } => {
                write!(f, "admission denied by {} tier after eviction retry", tier)
            }
            CacheError::SerializationError(msg) => write!(f, "serialization error: {}", msg),
            CacheError::DeserializationError(msg) => write!(f, "deserialization error: {}", msg),
            CacheError::LoaderFailure(msg) => write!(f, "loader failure: {}", msg),
            CacheError::WriteThroughFailure(msg) => write!(f, "write-through failure: {}", msg),
            CacheError::WriteBehindSaturated => write!(f, "write-behind queue saturated"),
            CacheError::Io(msg) => write!(f, "i/o error: {}", msg),
            CacheError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {}", msg),
            CacheError::CacheClosed => write!(f, "cache is closed"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}
