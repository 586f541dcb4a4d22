//! # access-guard
//!
//! Request guarding for public, unauthenticated web endpoints: a sliding-window
//! rate limiter with escalating blocks, cache-backed visitor sessions with an
//! anti-forgery token, and a leveled, rotating audit log.
//!
//! All three services share one TTL key-value store (in-process by default,
//! Redis with the `redis-storage` feature) and one clock, so every process of
//! a deployment sees the same windows, blocks and sessions.
//!
//! ## Quick Start
//!
//! ```rust
//! use access_guard::{Guard, GuardConfig, SessionRequest};
//!
//! // Defaults: 10 searches, 30 pagination requests and 5 shares per minute
//! let guard = Guard::from_config(&GuardConfig::default()).unwrap();
//!
//! let identity = guard.identify("203.0.113.7".parse().unwrap(), None);
//! let remaining = guard.check("search", &identity).unwrap().into_result();
//! assert_eq!(remaining, Ok(9));
//!
//! // Sessions are created lazily on first use
//! let mut session = guard.open_session(SessionRequest::default(), &identity);
//! let token = session.get_token().unwrap();
//! assert!(session.verify_token(&token));
//! assert!(session.pending_cookie().is_some());
//! ```
//!
//! Configuration is usually loaded from TOML:
//!
//! ```rust
//! use access_guard::GuardConfig;
//!
//! let config = GuardConfig::from_toml_str(
//!     r#"
//!     [rate_limit.actions.search]
//!     limit = 20
//!     window_secs = 60
//!
//!     [session]
//!     cookie_name = "guard_session"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.rate_limit.actions["search"].limit, 20);
//! ```
//!
//! ## Features
//!
//! ### Rate Limiting
//! - **Per action and caller**: each `(action, caller)` pair has its own window
//! - **Exact counts**: request counters only change through atomic increments
//! - **Escalating blocks**: `base * 2^violations`, capped, with violations
//!   forgotten after a decay horizon
//! - **Privacy**: callers are keyed by a salted SHA-256 of their address
//!
//! ### Sessions
//! - **Random identifiers**: 256-bit ids and tokens from the OS generator
//! - **Protected keys**: fingerprint, token and start time cannot be written
//! - **Hijack detection**: a session presented by a different user agent is
//!   discarded and replaced
//! - **Constant-time token checks**
//!
//! ### Audit Log
//! - **JSON lines** with RFC 3339 timestamps, filtered by minimum level
//! - **Sanitised context**: secrets redacted, paths hidden, long values truncated
//! - **Size-based rotation** with a bounded number of rotated files
//! - **Never fails**: entries the sink cannot take are forwarded to `tracing`
//!
//! ## Failure Handling
//!
//! Store outages never turn into errors for the visitor:
//!
//! | Operation | On store failure |
//! |-----------|------------------|
//! | Rate limit check | Request admitted, ERROR audit entry, circuit breaker notified |
//! | Session read | Caller's default returned |
//! | Session write | `false` returned, ERROR audit entry |
//! | Audit append | Entry forwarded to `tracing` target `access_guard::audit` |
//!
//! While the circuit breaker is open the limiter does not contact the store
//! at all; it admits every request until the recovery timeout has passed.
//!
//! ## Observability
//!
//! ```rust
//! # use access_guard::Guard;
//! # let guard = Guard::in_memory().unwrap();
//! let snapshot = guard.limiter().metrics().snapshot();
//! println!(
//!     "checks: {}, denied: {:.1}%, blocks: {}",
//!     snapshot.total_checks(),
//!     snapshot.denial_rate() * 100.0,
//!     snapshot.blocks_issued,
//! );
//! ```

pub mod error;

// Domain layer - pure types and arithmetic
pub mod domain;

// Application layer - services and ports
pub mod application;

// Infrastructure layer - adapters and wiring
pub mod infrastructure;

pub use error::{ConfigError, StoreError};

pub use domain::{
    entry::{LogEntry, LogLevel, Sanitizer},
    identity::{IdentityPolicy, RequestIdentity},
    session::{SessionInfo, SessionRecord},
    window::{BackoffPolicy, LimitConfig, RateDecision, RateWindow, WindowState},
};

pub use application::{
    audit::{AuditLog, AuditLogBuilder},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    limiter::{RateLimiter, RateLimiterBuilder, RateStats},
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, KvStore, LogFileInfo, LogSink},
    session::{
        SecureSession, SecurityRejection, SessionConfig, SessionCookie, SessionManager,
        SessionRequest,
    },
};

pub use infrastructure::{
    clock::SystemClock,
    config::GuardConfig,
    file_sink::{FileSinkConfig, RotatingFileSink},
    guard::{Guard, SharedStore},
    memory_store::MemoryStore,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::{RedisStore, RedisStoreConfig};
