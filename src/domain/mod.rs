//! Domain layer - pure types and arithmetic with no I/O.
//!
//! - Rate windows, escalation and decisions
//! - Caller identity derivation
//! - Session records and the protected-key policy
//! - Audit log entries and sanitising rules
//!
//! All types in this layer are pure and easily testable.

pub mod entry;
pub mod identity;
pub mod session;
pub mod window;
