//! Clock adapters for time operations.
//!
//! Provides SystemClock implementation for production use.
//!
//! # Testing
//!
//! See `MockClock` (in `crate::infrastructure::mocks`) for a controllable test clock.
//! Available with the `test-helpers` feature or in test builds:
//!
//! ```toml
//! [dev-dependencies]
//! access-guard = { version = "*", features = ["test-helpers"] }
//! ```

use crate::application::ports::Clock;
use std::time::SystemTime;

/// System clock implementation using `SystemTime::now()`.
///
/// Wall-clock time is required: window starts, block expiries and session
/// timestamps are stored in the shared store and read by other processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::new();
        // 2020-09-13, well in the past
        assert!(clock.unix_now() > 1_600_000_000);
        assert!(clock.now() <= SystemTime::now());
    }
}
