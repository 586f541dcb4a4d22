//! Rate windows and escalating blocks.
//!
//! A [`RateWindow`] is the persisted state for one `(action, caller)` pair.
//! The request count itself lives in a separate counter key that is only
//! ever touched through an atomic increment; the window record carries the
//! window boundaries, the [`WindowState`] and the violation history used for
//! escalation.
//!
//! All timestamps are unix seconds.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limit applied to one action: at most `limit` requests per `window`.
///
/// # Example
/// ```
/// use access_guard::LimitConfig;
/// use std::time::Duration;
///
/// let search = LimitConfig::new(5, Duration::from_secs(60)).unwrap();
/// assert_eq!(search.limit(), 5);
///
/// assert!(LimitConfig::new(0, Duration::from_secs(60)).is_err());
/// assert!(LimitConfig::new(5, Duration::ZERO).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    limit: u32,
    window: Duration,
}

impl LimitConfig {
    /// Create a limit of `limit` requests per `window`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLimit`] when `limit` is zero and
    /// [`ConfigError::InvalidWindow`] when the window is shorter than one second.
    pub fn new(limit: u32, window: Duration) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit);
        }
        if window.as_secs() == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        Ok(Self { limit, window })
    }

    /// Shorthand for `limit` requests per minute.
    pub fn per_minute(limit: u32) -> Result<Self, ConfigError> {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Maximum requests admitted per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole seconds.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }
}

/// Escalation settings for repeat offenders.
///
/// The n-th block within the decay horizon lasts `base_block * 2^n`, capped
/// at `max_block`. A caller with no violation for longer than
/// `decay_horizon` starts again from the base block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_block: Duration,
    max_block: Duration,
    decay_horizon: Duration,
}

impl BackoffPolicy {
    /// Create an escalation policy.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidBackoff`] if the base block is shorter
    /// than a second, the cap is below the base, or the horizon is zero.
    pub fn new(
        base_block: Duration,
        max_block: Duration,
        decay_horizon: Duration,
    ) -> Result<Self, ConfigError> {
        if base_block.as_secs() == 0 {
            return Err(ConfigError::InvalidBackoff(
                "base block must be at least one second".to_string(),
            ));
        }
        if max_block < base_block {
            return Err(ConfigError::InvalidBackoff(
                "max block must not be shorter than the base block".to_string(),
            ));
        }
        if decay_horizon.as_secs() == 0 {
            return Err(ConfigError::InvalidBackoff(
                "decay horizon must be at least one second".to_string(),
            ));
        }
        Ok(Self {
            base_block,
            max_block,
            decay_horizon,
        })
    }

    /// Duration of the first block.
    pub fn base_block(&self) -> Duration {
        self.base_block
    }

    /// Upper bound on any block.
    pub fn max_block(&self) -> Duration {
        self.max_block
    }

    /// Quiet period after which the violation count decays to zero.
    pub fn decay_horizon(&self) -> Duration {
        self.decay_horizon
    }

    /// Block duration for a caller with `prior_violations` recent violations.
    pub fn block_for(&self, prior_violations: u32) -> Duration {
        let factor = 1u64.checked_shl(prior_violations).unwrap_or(u64::MAX);
        let secs = self
            .base_block
            .as_secs()
            .saturating_mul(factor)
            .min(self.max_block.as_secs());
        Duration::from_secs(secs)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_block: Duration::from_secs(60),
            max_block: Duration::from_secs(3600),
            decay_horizon: Duration::from_secs(86_400),
        }
    }
}

/// Where a window stands relative to its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowState {
    /// Below the limit.
    Open,
    /// The limit has been reached; the next request in this window is denied.
    Throttled,
    /// Every request is denied until `until`.
    Blocked {
        /// Unix seconds at which the block lapses.
        until: u64,
    },
}

impl WindowState {
    /// Block expiry, if this is a block.
    pub fn blocked_until(&self) -> Option<u64> {
        match self {
            WindowState::Blocked { until } => Some(*until),
            _ => None,
        }
    }
}

/// Persisted rate state for one `(action, caller)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Start of the current window.
    pub window_start: u64,
    /// Window length in seconds at the time the window started.
    pub window_length: u64,
    /// Current state.
    pub state: WindowState,
    /// Violations since the last decay.
    pub violation_count: u32,
    /// Time of the most recent violation.
    pub last_violation_at: Option<u64>,
}

impl RateWindow {
    /// A fresh window with no history.
    pub fn open(now: u64, window_length: u64) -> Self {
        Self {
            window_start: now,
            window_length,
            state: WindowState::Open,
            violation_count: 0,
            last_violation_at: None,
        }
    }

    /// Block expiry if a block is still in force at `now`.
    pub fn active_block(&self, now: u64) -> Option<u64> {
        self.state.blocked_until().filter(|until| now < *until)
    }

    /// Whether a request at `now` must start a new window.
    ///
    /// True once a block has lapsed, or once more than `window_length`
    /// seconds have passed since the window started.
    pub fn needs_new_window(&self, now: u64, window_length: u64) -> bool {
        match self.state {
            WindowState::Blocked { until } => now >= until,
            WindowState::Open | WindowState::Throttled => {
                now.saturating_sub(self.window_start) > window_length
            }
        }
    }

    /// A new window starting at `now` that keeps the violation history.
    pub fn restarted(&self, now: u64, window_length: u64) -> Self {
        Self {
            window_start: now,
            window_length,
            state: WindowState::Open,
            violation_count: self.violation_count,
            last_violation_at: self.last_violation_at,
        }
    }

    /// Violation count as seen at `now`, after decay.
    pub fn effective_violations(&self, now: u64, backoff: &BackoffPolicy) -> u32 {
        match self.last_violation_at {
            Some(last) if now.saturating_sub(last) > backoff.decay_horizon().as_secs() => 0,
            _ => self.violation_count,
        }
    }

    /// Record a violation at `now` and block the caller.
    ///
    /// Returns the block duration.
    pub fn escalate(&mut self, now: u64, backoff: &BackoffPolicy) -> Duration {
        let prior = self.effective_violations(now, backoff);
        let duration = backoff.block_for(prior);
        self.state = WindowState::Blocked {
            until: now.saturating_add(duration.as_secs()),
        };
        self.violation_count = prior.saturating_add(1);
        self.last_violation_at = Some(now);
        duration
    }

    /// How long the record must survive in the store.
    ///
    /// Long enough to cover the live window, any block, and the violation
    /// decay horizon.
    pub fn ttl(&self, now: u64, backoff: &BackoffPolicy) -> Duration {
        let window_end = self.window_start.saturating_add(self.window_length);
        let mut keep_until = window_end;
        if let Some(until) = self.state.blocked_until() {
            keep_until = keep_until.max(until);
        }
        if let Some(last) = self.last_violation_at {
            keep_until = keep_until.max(last.saturating_add(backoff.decay_horizon().as_secs()));
        }
        Duration::from_secs(keep_until.saturating_sub(now).max(1))
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// The request must be rejected with "too many requests".
    Limited {
        /// Time until the caller may retry.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Check if this decision admits the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    /// Check if this decision rejects the request.
    pub fn is_limited(&self) -> bool {
        matches!(self, RateDecision::Limited { .. })
    }

    /// Retry hint in whole seconds (at least 1) for a `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateDecision::Allowed { .. } => None,
            RateDecision::Limited { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
        }
    }
}
