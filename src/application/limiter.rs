//! Sliding-window rate limiter with escalating blocks.
//!
//! Each `(action, caller)` pair owns a window record (`rl:<action>:<caller>`)
//! and one counter per window (`rl:<action>:<caller>:<window_start>`). The
//! counter is only ever changed through [`KvStore::atomic_increment`], so
//! concurrent requests never lose counts. The window record (state, block,
//! violation history) is updated with bounded compare-and-swap loops; a
//! caller that keeps losing those races is admitted.

use crate::application::audit::AuditLog;
use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, KvStore};
use crate::domain::identity::{IdentityPolicy, RequestIdentity};
use crate::domain::window::{BackoffPolicy, LimitConfig, RateDecision, RateWindow, WindowState};
use crate::error::{ConfigError, StoreError};
use crate::infrastructure::clock::SystemClock;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on optimistic retries when updating a window record.
pub const MAX_CAS_ATTEMPTS: usize = 8;

const AUDIT_CATEGORY: &str = "rate_limit";

/// Read-only view of a caller's limiter state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateStats {
    /// Requests admitted in the live window.
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub is_blocked: bool,
    /// End of the active block (unix seconds).
    pub blocked_until: Option<u64>,
    pub state: WindowState,
    /// Violations still counting towards escalation.
    pub violation_count: u32,
}

/// A window record as loaded from the store, with the exact bytes it was
/// read from (needed as the expected value of the next compare-and-swap).
struct Loaded {
    window: RateWindow,
    raw: Vec<u8>,
}

/// Coordinates rate limiting decisions.
#[derive(Debug, Clone)]
pub struct RateLimiter<S>
where
    S: KvStore,
{
    store: S,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    backoff: BackoffPolicy,
    identity_policy: IdentityPolicy,
    key_prefix: String,
    metrics: Metrics,
    circuit_breaker: Arc<CircuitBreaker>,
}

/// Builder for [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimiterBuilder<S> {
    store: S,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<AuditLog>>,
    backoff: BackoffPolicy,
    identity_policy: IdentityPolicy,
    key_prefix: String,
    circuit_breaker_config: CircuitBreakerConfig,
}

impl<S> RateLimiterBuilder<S>
where
    S: KvStore,
{
    /// Time source for windows and blocks (default: system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Audit log receiving block and outage entries.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Escalation settings (default: 60 s base, 1 h cap, 24 h decay).
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// How callers are keyed (default: hashed address only).
    pub fn with_identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.identity_policy = policy;
        self
    }

    /// Prefix of every key the limiter writes (default: `rl:`).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Failure threshold and recovery timeout of the store circuit breaker
    /// (default: 5 failures, 30 s).
    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    /// Build the rate limiter.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLimiter`] for an empty key prefix or a
    /// zero circuit breaker threshold.
    pub fn build(self) -> Result<RateLimiter<S>, ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidLimiter(
                "key prefix must not be empty".to_string(),
            ));
        }
        if self.circuit_breaker_config.failure_threshold == 0 {
            return Err(ConfigError::InvalidLimiter(
                "circuit breaker failure threshold must be greater than 0".to_string(),
            ));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let circuit_breaker = Arc::new(CircuitBreaker::with_clock(
            self.circuit_breaker_config,
            Arc::clone(&clock),
        ));

        Ok(RateLimiter {
            store: self.store,
            clock,
            audit: self
                .audit
                .unwrap_or_else(|| Arc::new(AuditLog::tracing_only())),
            backoff: self.backoff,
            identity_policy: self.identity_policy,
            key_prefix: self.key_prefix,
            metrics: Metrics::new(),
            circuit_breaker,
        })
    }
}

impl<S> RateLimiter<S>
where
    S: KvStore,
{
    /// Start building a rate limiter over `store`.
    ///
    /// # Example
    /// ```
    /// use access_guard::{LimitConfig, MemoryStore, RateLimiter, RequestIdentity};
    ///
    /// let limiter = RateLimiter::builder(MemoryStore::new())
    ///     .with_key_prefix("api-rl:")
    ///     .build()
    ///     .unwrap();
    /// let caller = RequestIdentity::from_address("192.0.2.1", "salt");
    /// let config = LimitConfig::per_minute(3).unwrap();
    /// assert!(limiter.check("search", &caller, &config).is_allowed());
    /// ```
    pub fn builder(store: S) -> RateLimiterBuilder<S> {
        RateLimiterBuilder {
            store,
            clock: None,
            audit: None,
            backoff: BackoffPolicy::default(),
            identity_policy: IdentityPolicy::default(),
            key_prefix: "rl:".to_string(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
        }
    }

    /// Decide whether the caller may perform `action` now.
    ///
    /// Counts the request unless the caller is already blocked. A request
    /// that pushes the count past the limit starts an escalating block.
    ///
    /// # Fail-Safe Behavior
    /// Store failures admit the request, write an ERROR audit entry and are
    /// reported to the circuit breaker. While the circuit is open the store
    /// is not contacted at all.
    pub fn check(
        &self,
        action: &str,
        identity: &RequestIdentity,
        config: &LimitConfig,
    ) -> RateDecision {
        if !self.circuit_breaker.allow_request() {
            self.metrics.record_allowed();
            self.metrics.record_store_failure();
            return RateDecision::Allowed {
                remaining: config.limit(),
            };
        }

        let subject = identity.limiter_subject(self.identity_policy);
        let decision = match self.evaluate(action, &subject, config) {
            Ok(decision) => {
                self.circuit_breaker.record_success();
                decision
            }
            Err(StoreError::Contention) => {
                self.circuit_breaker.record_success();
                tracing::debug!(action, "window update contended, admitting request");
                RateDecision::Allowed { remaining: 0 }
            }
            Err(err) => {
                self.circuit_breaker.record_failure();
                self.metrics.record_store_failure();
                tracing::warn!(action, error = %err, "rate limit store failed, admitting request");
                self.audit.error(
                    AUDIT_CATEGORY,
                    "rate limit store unavailable, request admitted",
                    &[("action", action.to_string()), ("error", err.to_string())],
                );
                RateDecision::Allowed {
                    remaining: config.limit(),
                }
            }
        };

        match decision {
            RateDecision::Allowed { .. } => self.metrics.record_allowed(),
            RateDecision::Limited { .. } => self.metrics.record_limited(),
        }
        tracing::debug!(action, subject = %subject, ?decision, "rate limit check");
        decision
    }

    /// Current state for the caller, without counting a request.
    pub fn get_stats(
        &self,
        action: &str,
        identity: &RequestIdentity,
        config: &LimitConfig,
    ) -> Result<RateStats, StoreError> {
        let now = self.clock.unix_now();
        let key = self.window_key(action, &identity.limiter_subject(self.identity_policy));
        let limit = config.limit();
        let idle = |violation_count| RateStats {
            current_count: 0,
            limit,
            remaining: limit,
            is_blocked: false,
            blocked_until: None,
            state: WindowState::Open,
            violation_count,
        };

        let Some(loaded) = self.load(&key)? else {
            return Ok(idle(0));
        };
        let window = loaded.window;
        if window.needs_new_window(now, config.window_secs()) {
            return Ok(idle(window.effective_violations(now, &self.backoff)));
        }

        let counted = self.read_counter(&self.counter_key(&key, window.window_start))?;
        let current_count = u32::try_from(counted.min(u64::from(limit))).unwrap_or(limit);
        let blocked_until = window.active_block(now);
        Ok(RateStats {
            current_count,
            limit,
            remaining: if blocked_until.is_some() {
                0
            } else {
                limit - current_count
            },
            is_blocked: blocked_until.is_some(),
            blocked_until,
            state: window.state,
            violation_count: window.effective_violations(now, &self.backoff),
        })
    }

    /// Forget everything about the caller for `action`, blocks included.
    pub fn reset(&self, action: &str, identity: &RequestIdentity) -> Result<(), StoreError> {
        let subject = identity.limiter_subject(self.identity_policy);
        let key = self.window_key(action, &subject);
        if let Some(loaded) = self.load(&key)? {
            self.store
                .delete(&self.counter_key(&key, loaded.window.window_start))?;
        }
        self.store.delete(&key)?;
        self.audit.info(
            AUDIT_CATEGORY,
            "rate limit reset",
            &[("action", action.to_string()), ("identifier", subject)],
        );
        Ok(())
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get a reference to the circuit breaker.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        self.identity_policy
    }

    fn evaluate(
        &self,
        action: &str,
        subject: &str,
        config: &LimitConfig,
    ) -> Result<RateDecision, StoreError> {
        let now = self.clock.unix_now();
        let key = self.window_key(action, subject);
        let current = self.current_window(&key, now, config.window_secs())?;

        if let Some(until) = current.window.active_block(now) {
            return Ok(RateDecision::Limited {
                retry_after: Duration::from_secs(until - now),
            });
        }

        // The counter outlives its window by a second so a request landing
        // exactly on the boundary still sees the window's count.
        let counter_ttl = Duration::from_secs(config.window_secs().saturating_add(1));
        let count = self.store.atomic_increment(
            &self.counter_key(&key, current.window.window_start),
            counter_ttl,
        )?;
        let limit = u64::from(config.limit());

        if count > limit {
            return self.escalate(&key, current, now, count, config, action, subject);
        }
        if count == limit {
            self.mark_throttled(&key, &current, now);
            return Ok(RateDecision::Allowed { remaining: 0 });
        }
        Ok(RateDecision::Allowed {
            remaining: u32::try_from(limit - count).unwrap_or(config.limit()),
        })
    }

    /// Load the live window, starting a new one when the old one has run
    /// out or its block has lapsed.
    fn current_window(&self, key: &str, now: u64, window_len: u64) -> Result<Loaded, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(key)?;
            let existing = raw.as_deref().and_then(decode_window);
            if let (Some(window), Some(bytes)) = (&existing, &raw) {
                if !window.needs_new_window(now, window_len) {
                    return Ok(Loaded {
                        window: window.clone(),
                        raw: bytes.clone(),
                    });
                }
            }

            let fresh = match &existing {
                Some(window) => window.restarted(now, window_len),
                None => RateWindow::open(now, window_len),
            };
            let bytes = serde_json::to_vec(&fresh)?;
            if self.store.compare_and_swap(
                key,
                raw.as_deref(),
                &bytes,
                fresh.ttl(now, &self.backoff),
            )? {
                return Ok(Loaded {
                    window: fresh,
                    raw: bytes,
                });
            }
        }
        Err(StoreError::Contention)
    }

    #[allow(clippy::too_many_arguments)]
    fn escalate(
        &self,
        key: &str,
        mut current: Loaded,
        now: u64,
        count: u64,
        config: &LimitConfig,
        action: &str,
        subject: &str,
    ) -> Result<RateDecision, StoreError> {
        let counted_window = current.window.window_start;

        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(until) = current.window.active_block(now) {
                // A concurrent request already blocked the caller
                return Ok(RateDecision::Limited {
                    retry_after: Duration::from_secs(until - now),
                });
            }
            if current.window.window_start != counted_window {
                return Err(StoreError::Contention);
            }

            let mut blocked = current.window.clone();
            let duration = blocked.escalate(now, &self.backoff);
            let bytes = serde_json::to_vec(&blocked)?;
            if self.store.compare_and_swap(
                key,
                Some(&current.raw),
                &bytes,
                blocked.ttl(now, &self.backoff),
            )? {
                self.metrics.record_block();
                self.audit.warning(
                    AUDIT_CATEGORY,
                    "rate limit exceeded, caller blocked",
                    &[
                        ("action", action.to_string()),
                        ("identifier", subject.to_string()),
                        ("count", count.to_string()),
                        ("limit", config.limit().to_string()),
                        ("block_secs", duration.as_secs().to_string()),
                        ("violations", blocked.violation_count.to_string()),
                    ],
                );
                return Ok(RateDecision::Limited {
                    retry_after: duration,
                });
            }

            current = self.load(key)?.ok_or(StoreError::Contention)?;
        }
        Err(StoreError::Contention)
    }

    /// Best effort: losing the race or failing here changes nothing visible.
    fn mark_throttled(&self, key: &str, current: &Loaded, now: u64) {
        if current.window.state != WindowState::Open {
            return;
        }
        let mut throttled = current.window.clone();
        throttled.state = WindowState::Throttled;
        let result = serde_json::to_vec(&throttled)
            .map_err(StoreError::from)
            .and_then(|bytes| {
                self.store.compare_and_swap(
                    key,
                    Some(&current.raw),
                    &bytes,
                    throttled.ttl(now, &self.backoff),
                )
            });
        if let Err(err) = result {
            tracing::debug!(error = %err, "could not mark window throttled");
        }
    }

    fn load(&self, key: &str) -> Result<Option<Loaded>, StoreError> {
        Ok(self.store.get(key)?.and_then(|raw| {
            decode_window(&raw).map(|window| Loaded { window, raw })
        }))
    }

    fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(key)?
            .and_then(|raw| std::str::from_utf8(&raw).ok()?.trim().parse().ok())
            .unwrap_or(0))
    }

    fn window_key(&self, action: &str, subject: &str) -> String {
        format!("{}{}:{}", self.key_prefix, action, subject)
    }

    fn counter_key(&self, window_key: &str, window_start: u64) -> String {
        format!("{}:{}", window_key, window_start)
    }
}

fn decode_window(raw: &[u8]) -> Option<RateWindow> {
    match serde_json::from_slice(raw) {
        Ok(window) => Some(window),
        Err(err) => {
            tracing::warn!(error = %err, "discarding undecodable rate window");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::MockClock;

    fn limiter() -> (RateLimiter<Arc<MemoryStore>>, Arc<MemoryStore>, MockClock) {
        let clock = MockClock::at_unix(1_700_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::builder(Arc::clone(&store))
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (limiter, store, clock)
    }

    fn caller() -> RequestIdentity {
        RequestIdentity::from_address("203.0.113.7", "salt")
    }

    #[test]
    fn test_remaining_counts_down() {
        let (limiter, _, _) = limiter();
        let config = LimitConfig::per_minute(3).unwrap();

        assert_eq!(
            limiter.check("search", &caller(), &config),
            RateDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            limiter.check("search", &caller(), &config),
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check("search", &caller(), &config),
            RateDecision::Allowed { remaining: 0 }
        );
        assert!(limiter.check("search", &caller(), &config).is_limited());
    }

    #[test]
    fn test_counter_key_is_separate_from_window_record() {
        let (limiter, store, _) = limiter();
        let config = LimitConfig::per_minute(5).unwrap();
        limiter.check("share", &caller(), &config);

        let subject = caller().limiter_subject(IdentityPolicy::AddressOnly);
        let key = format!("rl:share:{}", subject);
        assert!(store.get(&key).unwrap().is_some());
        assert_eq!(
            store.get(&format!("{}:1700000000", key)).unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn test_undecodable_record_is_replaced() {
        let (limiter, store, _) = limiter();
        let config = LimitConfig::per_minute(5).unwrap();
        let subject = caller().limiter_subject(IdentityPolicy::AddressOnly);
        store
            .set(&format!("rl:search:{}", subject), b"not json", Duration::from_secs(60))
            .unwrap();

        assert_eq!(
            limiter.check("search", &caller(), &config),
            RateDecision::Allowed { remaining: 4 }
        );
    }

    #[test]
    fn test_throttled_state_at_limit() {
        let (limiter, _, _) = limiter();
        let config = LimitConfig::per_minute(2).unwrap();
        limiter.check("page", &caller(), &config);
        limiter.check("page", &caller(), &config);

        let stats = limiter.get_stats("page", &caller(), &config).unwrap();
        assert_eq!(stats.state, WindowState::Throttled);
        assert_eq!(stats.remaining, 0);
        assert!(!stats.is_blocked);
    }

    #[test]
    fn test_builder_rejects_empty_prefix() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            RateLimiter::builder(store).with_key_prefix("").build(),
            Err(ConfigError::InvalidLimiter(_))
        ));
    }
}
