//! Error types shared across the crate.
//!
//! Only [`ConfigError`] is meant to abort a caller's request: it signals a
//! programming or deployment mistake. [`StoreError`] is recovered locally by
//! the services (fail open for rate limiting and session reads, fail closed
//! for session writes).

use thiserror::Error;

/// Invalid configuration passed to one of the services.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A rate limit must admit at least one request.
    #[error("rate limit must be greater than 0")]
    InvalidLimit,
    /// A rate window must be at least one second long.
    #[error("rate window must be at least one second")]
    InvalidWindow,
    /// Escalation settings are inconsistent.
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
    /// Rate limiter settings (key prefix, circuit breaker) are inconsistent.
    #[error("invalid rate limiter settings: {0}")]
    InvalidLimiter(String),
    /// Session settings are inconsistent.
    #[error("invalid session settings: {0}")]
    InvalidSession(String),
    /// Audit log settings are inconsistent.
    #[error("invalid audit log settings: {0}")]
    InvalidAudit(String),
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(String),
    /// The configuration file is not valid TOML for [`GuardConfig`](crate::GuardConfig).
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// A backing store could not be opened at startup.
    #[error("failed to open store: {0}")]
    Store(String),
}

/// Failure talking to the shared TTL key-value store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured timeout.
    #[error("store operation timed out")]
    Timeout,
    /// A stored record could not be encoded or decoded.
    #[error("store serialization failed: {0}")]
    Serialization(String),
    /// An optimistic update kept losing to concurrent writers.
    #[error("store update contention")]
    Contention,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
