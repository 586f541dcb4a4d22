//! Circuit breaker around the shared key-value store.
//!
//! When the store keeps failing, the breaker opens and the rate limiter stops
//! contacting it for a while, admitting requests instead (fail-open). After
//! the recovery timeout one probe request is let through; its outcome closes
//! or re-opens the circuit.

use crate::application::ports::Clock;
use crate::infrastructure::clock::SystemClock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls go through.
    Closed = 0,
    /// Store calls are skipped and requests are admitted.
    Open = 1,
    /// A probe is testing whether the store has recovered.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before attempting recovery
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker protecting store calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    /// Unix milliseconds of the most recent failure.
    last_failure_millis: AtomicU64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a circuit breaker that reads time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_millis: AtomicU64::new(0),
            config,
            clock,
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if the store may be contacted.
    ///
    /// Returns `false` while the circuit is open; callers then fail open.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .now_millis()
                    .saturating_sub(self.last_failure_millis.load(Ordering::Acquire));
                if u128::from(elapsed) < self.config.recovery_timeout.as_millis() {
                    return false;
                }
                // Only one caller moves the circuit to HalfOpen
                let result = self.state.compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                result.is_ok() || self.state() == CircuitState::HalfOpen
            }
        }
    }

    /// Record a successful store call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                tracing::info!("store recovered, circuit closed");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed store call.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_millis
            .store(self.now_millis(), Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                self.state
                    .store(CircuitState::Open as u8, Ordering::Release);
            }
            CircuitState::Closed => {
                if failures >= u64::from(self.config.failure_threshold) {
                    self.state
                        .store(CircuitState::Open as u8, Ordering::Release);
                    tracing::warn!(failures, "store failing, circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        self.clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
