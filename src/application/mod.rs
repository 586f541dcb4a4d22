//! Application layer - the services built on the domain types.
//!
//! - Rate limiter (decisions, escalation, stats)
//! - Secure session (per-request session over the shared store)
//! - Audit log (sanitised, leveled entries with a tracing fallback)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod audit;
pub mod circuit_breaker;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod session;
