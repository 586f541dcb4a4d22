use access_guard::infrastructure::mocks::{FailingStore, MockClock, SwitchableStore};
use access_guard::{
    AuditLog, BackoffPolicy, CircuitBreakerConfig, CircuitState, Clock, IdentityPolicy, KvStore,
    LimitConfig, LogFileInfo, LogSink, MemoryStore, RateDecision, RateLimiter, RequestIdentity,
    StoreError, WindowState,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const START: u64 = 1_760_875_200;

fn setup() -> (RateLimiter<Arc<MemoryStore>>, MockClock) {
    setup_with_backoff(BackoffPolicy::default())
}

fn setup_with_backoff(backoff: BackoffPolicy) -> (RateLimiter<Arc<MemoryStore>>, MockClock) {
    let clock = MockClock::at_unix(START);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let limiter = RateLimiter::builder(store)
        .with_clock(Arc::new(clock.clone()))
        .with_backoff(backoff)
        .build()
        .unwrap();
    (limiter, clock)
}

fn caller(address: &str) -> RequestIdentity {
    RequestIdentity::from_address(address, "test-salt")
}

/// Exceed `config` once and return the block length.
fn trip(
    limiter: &RateLimiter<Arc<MemoryStore>>,
    who: &RequestIdentity,
    config: &LimitConfig,
) -> u64 {
    for _ in 0..config.limit() {
        assert!(limiter.check("search", who, config).is_allowed());
    }
    limiter
        .check("search", who, config)
        .retry_after_secs()
        .expect("request over the limit must be limited")
}

#[derive(Debug, Default)]
struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    fn lines(&self) -> Vec<serde_json::Value> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn list_files(&self) -> io::Result<Vec<LogFileInfo>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_exactly_limit_requests_are_admitted() {
    let (limiter, _clock) = setup();
    let config = LimitConfig::per_minute(5).unwrap();
    let who = caller("203.0.113.7");

    for expected_remaining in (0..5).rev() {
        assert_eq!(
            limiter.check("search", &who, &config),
            RateDecision::Allowed {
                remaining: expected_remaining
            }
        );
    }

    let denied = limiter.check("search", &who, &config);
    assert!(denied.is_limited());
    assert_eq!(denied.retry_after_secs(), Some(60));

    // Further requests stay denied without extending the block
    let again = limiter.check("search", &who, &config);
    assert_eq!(again.retry_after_secs(), Some(60));
}

#[test]
fn test_new_window_after_window_length() {
    let (limiter, clock) = setup();
    let config = LimitConfig::per_minute(3).unwrap();
    let who = caller("203.0.113.7");

    for _ in 0..3 {
        assert!(limiter.check("search", &who, &config).is_allowed());
    }

    clock.advance(Duration::from_secs(61));
    assert_eq!(
        limiter.check("search", &who, &config),
        RateDecision::Allowed { remaining: 2 }
    );
}

#[test]
fn test_block_lapses_into_a_fresh_window() {
    let (limiter, clock) = setup();
    let config = LimitConfig::per_minute(3).unwrap();
    let who = caller("203.0.113.7");

    assert_eq!(trip(&limiter, &who, &config), 60);

    clock.advance(Duration::from_secs(59));
    assert_eq!(
        limiter.check("search", &who, &config).retry_after_secs(),
        Some(1)
    );

    clock.advance(Duration::from_secs(1));
    assert_eq!(
        limiter.check("search", &who, &config),
        RateDecision::Allowed { remaining: 2 }
    );
}

#[test]
fn test_repeat_violations_double_the_block() {
    let (limiter, clock) = setup();
    let config = LimitConfig::per_minute(3).unwrap();
    let who = caller("203.0.113.7");

    let mut expected = 60;
    for _ in 0..4 {
        let block = trip(&limiter, &who, &config);
        assert_eq!(block, expected);
        clock.advance(Duration::from_secs(block));
        expected *= 2;
    }

    let stats = limiter.get_stats("search", &who, &config).unwrap();
    assert_eq!(stats.violation_count, 4);
}

#[test]
fn test_block_never_exceeds_maximum() {
    let backoff = BackoffPolicy::new(
        Duration::from_secs(60),
        Duration::from_secs(100),
        Duration::from_secs(86_400),
    )
    .unwrap();
    let (limiter, clock) = setup_with_backoff(backoff);
    let config = LimitConfig::per_minute(2).unwrap();
    let who = caller("203.0.113.7");

    assert_eq!(trip(&limiter, &who, &config), 60);
    clock.advance(Duration::from_secs(60));
    assert_eq!(trip(&limiter, &who, &config), 100);
    clock.advance(Duration::from_secs(100));
    assert_eq!(trip(&limiter, &who, &config), 100);
}

#[test]
fn test_violations_decay_after_quiet_period() {
    let backoff = BackoffPolicy::new(
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_secs(300),
    )
    .unwrap();
    let (limiter, clock) = setup_with_backoff(backoff);
    let config = LimitConfig::per_minute(2).unwrap();
    let who = caller("203.0.113.7");

    assert_eq!(trip(&limiter, &who, &config), 60);
    clock.advance(Duration::from_secs(60));
    assert_eq!(trip(&limiter, &who, &config), 120);

    clock.advance(Duration::from_secs(120 + 301));
    assert_eq!(trip(&limiter, &who, &config), 60);
}

#[test]
fn test_stats_report_blocked_caller() {
    let (limiter, _clock) = setup();
    let config = LimitConfig::per_minute(5).unwrap();
    let who = caller("203.0.113.7");

    for _ in 0..6 {
        limiter.check("share", &who, &config);
    }

    let stats = limiter.get_stats("share", &who, &config).unwrap();
    assert_eq!(stats.current_count, 5);
    assert_eq!(stats.limit, 5);
    assert_eq!(stats.remaining, 0);
    assert!(stats.is_blocked);
    assert_eq!(stats.blocked_until, Some(START + 60));
    assert_eq!(stats.state, WindowState::Blocked { until: START + 60 });
    assert_eq!(stats.violation_count, 1);
}

#[test]
fn test_stats_do_not_count_requests() {
    let (limiter, _clock) = setup();
    let config = LimitConfig::per_minute(5).unwrap();
    let who = caller("203.0.113.7");

    let idle = limiter.get_stats("search", &who, &config).unwrap();
    assert_eq!(idle.current_count, 0);
    assert_eq!(idle.remaining, 5);
    assert!(!idle.is_blocked);

    limiter.check("search", &who, &config);
    for _ in 0..3 {
        let stats = limiter.get_stats("search", &who, &config).unwrap();
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.remaining, 4);
    }
}

#[test]
fn test_reset_clears_block() {
    let (limiter, _clock) = setup();
    let config = LimitConfig::per_minute(2).unwrap();
    let who = caller("203.0.113.7");

    trip(&limiter, &who, &config);
    limiter.reset("search", &who).unwrap();

    assert_eq!(
        limiter.check("search", &who, &config),
        RateDecision::Allowed { remaining: 1 }
    );
    assert_eq!(
        limiter.get_stats("search", &who, &config).unwrap().violation_count,
        0
    );
}

#[test]
fn test_actions_and_callers_are_independent() {
    let (limiter, _clock) = setup();
    let config = LimitConfig::per_minute(1).unwrap();
    let alice = caller("203.0.113.7");
    let bob = caller("198.51.100.20");

    assert!(limiter.check("search", &alice, &config).is_allowed());
    assert!(limiter.check("search", &alice, &config).is_limited());

    assert!(limiter.check("share", &alice, &config).is_allowed());
    assert!(limiter.check("search", &bob, &config).is_allowed());
}

#[test]
fn test_identity_policy_controls_grouping() {
    let clock = MockClock::at_unix(START);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let config = LimitConfig::per_minute(2).unwrap();

    let by_user = RateLimiter::builder(Arc::clone(&store))
        .with_clock(Arc::new(clock.clone()))
        .with_identity_policy(IdentityPolicy::UserWhenAuthenticated)
        .with_key_prefix("user-rl:")
        .build()
        .unwrap();
    // The same account from two addresses shares one window
    assert!(by_user
        .check("search", &caller("203.0.113.7").with_user("42"), &config)
        .is_allowed());
    assert!(by_user
        .check("search", &caller("198.51.100.20").with_user("42"), &config)
        .is_allowed());
    assert!(by_user
        .check("search", &caller("192.0.2.1").with_user("42"), &config)
        .is_limited());

    let by_address = RateLimiter::builder(store)
        .with_clock(Arc::new(clock))
        .build()
        .unwrap();
    // Different accounts behind one address share one window
    assert!(by_address
        .check("search", &caller("203.0.113.7").with_user("1"), &config)
        .is_allowed());
    assert!(by_address
        .check("search", &caller("203.0.113.7").with_user("2"), &config)
        .is_allowed());
    assert!(by_address
        .check("search", &caller("203.0.113.7").with_user("3"), &config)
        .is_limited());
}

#[test]
fn test_user_ids_stay_out_of_keys_and_audit() {
    let clock = MockClock::at_unix(START);
    let sink = Arc::new(MemorySink::default());
    let audit = Arc::new(
        AuditLog::builder()
            .with_sink(Arc::clone(&sink) as Arc<dyn LogSink>)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let limiter = RateLimiter::builder(Arc::clone(&store))
        .with_clock(Arc::new(clock))
        .with_audit(audit)
        .with_identity_policy(IdentityPolicy::UserWhenAuthenticated)
        .build()
        .unwrap();
    let config = LimitConfig::per_minute(1).unwrap();
    let who = caller("203.0.113.7").with_user("mallory:search:a");

    assert!(limiter.check("search", &who, &config).is_allowed());
    assert!(limiter.check("search", &who, &config).is_limited());

    let subject = who.limiter_subject(IdentityPolicy::UserWhenAuthenticated);
    assert!(store.get(&format!("rl:search:{}", subject)).unwrap().is_some());
    assert!(store.get("rl:search:u:mallory:search:a").unwrap().is_none());

    let lines = sink.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["context"]["identifier"], subject.as_str());
    assert!(!lines[0].to_string().contains("mallory"));
}

#[test]
fn test_store_failure_admits_requests() {
    let limiter = RateLimiter::builder(FailingStore::with_error(StoreError::Timeout))
        .build()
        .unwrap();
    let config = LimitConfig::per_minute(1).unwrap();
    let who = caller("203.0.113.7");

    for _ in 0..3 {
        assert_eq!(
            limiter.check("search", &who, &config),
            RateDecision::Allowed { remaining: 1 }
        );
    }
    assert_eq!(limiter.metrics().store_failures(), 3);
    assert!(limiter.get_stats("search", &who, &config).is_err());
    assert!(limiter.reset("search", &who).is_err());
}

#[test]
fn test_open_circuit_skips_the_store() {
    let clock = MockClock::at_unix(START);
    let store = SwitchableStore::new(Arc::new(clock.clone()));
    let limiter = RateLimiter::builder(store.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_circuit_breaker_config(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        })
        .build()
        .unwrap();
    let config = LimitConfig::per_minute(5).unwrap();
    let who = caller("203.0.113.7");

    store.set_failing(true);
    for _ in 0..3 {
        assert!(limiter.check("search", &who, &config).is_allowed());
    }
    assert_eq!(limiter.circuit_breaker().state(), CircuitState::Open);

    let calls = store.calls();
    for _ in 0..10 {
        assert!(limiter.check("search", &who, &config).is_allowed());
    }
    assert_eq!(store.calls(), calls);

    store.set_failing(false);
    clock.advance(Duration::from_secs(31));
    assert_eq!(
        limiter.check("search", &who, &config),
        RateDecision::Allowed { remaining: 4 }
    );
    assert_eq!(limiter.circuit_breaker().state(), CircuitState::Closed);
    assert!(store.calls() > calls);
}

#[test]
fn test_blocks_and_outages_are_audited() {
    let clock = MockClock::at_unix(START);
    let sink = Arc::new(MemorySink::default());
    let audit = Arc::new(
        AuditLog::builder()
            .with_sink(Arc::clone(&sink) as Arc<dyn LogSink>)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap(),
    );
    let store = SwitchableStore::new(Arc::new(clock.clone()));
    let limiter = RateLimiter::builder(store.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_audit(Arc::clone(&audit))
        .build()
        .unwrap();
    let config = LimitConfig::per_minute(1).unwrap();
    let who = caller("203.0.113.7");

    limiter.check("search", &who, &config);
    limiter.check("search", &who, &config);
    store.set_failing(true);
    limiter.check("share", &who, &config);

    let lines = sink.lines();
    assert_eq!(lines.len(), 2);

    assert_eq!(lines[0]["level"], "WARNING");
    assert_eq!(lines[0]["category"], "rate_limit");
    assert_eq!(lines[0]["timestamp"], "2025-10-19T12:00:00Z");
    assert_eq!(lines[0]["context"]["action"], "search");
    assert_eq!(lines[0]["context"]["count"], "2");
    assert_eq!(lines[0]["context"]["limit"], "1");
    assert_eq!(lines[0]["context"]["block_secs"], "60");
    assert_eq!(
        lines[0]["context"]["identifier"],
        who.limiter_subject(IdentityPolicy::AddressOnly).as_str()
    );

    assert_eq!(lines[1]["level"], "ERROR");
    assert_eq!(lines[1]["context"]["action"], "share");
}

#[test]
fn test_concurrent_callers_never_exceed_limit() {
    let clock = MockClock::at_unix(START);
    let clock_handle: Arc<dyn Clock> = Arc::new(clock);
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock_handle)));
    let limiter = Arc::new(
        RateLimiter::builder(store)
            .with_clock(clock_handle)
            .build()
            .unwrap(),
    );
    let config = LimitConfig::new(100, Duration::from_secs(60)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let who = caller("203.0.113.7");
                (0..40)
                    .filter(|_| limiter.check("search", &who, &config).is_allowed())
                    .count()
            })
        })
        .collect();

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 100);
    assert_eq!(limiter.metrics().checks_limited(), 220);
    assert_eq!(limiter.metrics().blocks_issued(), 1);
}

#[test]
fn test_old_windows_do_not_accumulate_in_memory_store() {
    let clock = MockClock::at_unix(START);
    let store =
        Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())).with_purge_interval(64));
    let limiter = RateLimiter::builder(Arc::clone(&store))
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let config = LimitConfig::new(5, Duration::from_secs(10)).unwrap();
    let who = caller("203.0.113.7");

    for _ in 0..1000 {
        assert!(limiter.check("search", &who, &config).is_allowed());
        clock.advance(Duration::from_secs(11));
    }

    // One window record, one live counter, and counters left since the last sweep
    assert!(store.len() <= 64, "store holds {} entries", store.len());
    assert_eq!(limiter.metrics().checks_allowed(), 1000);
}
