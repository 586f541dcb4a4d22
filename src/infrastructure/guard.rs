//! The assembled services, wired from a [`GuardConfig`].
//!
//! A dispatch layer builds one [`Guard`] at startup and, per request, one
//! [`RequestIdentity`] and one [`SecureSession`]:
//!
//! ```
//! use access_guard::{Guard, GuardConfig, SessionRequest};
//!
//! let guard = Guard::from_config(&GuardConfig::default()).unwrap();
//! let identity = guard.identify("192.0.2.1".parse().unwrap(), None);
//!
//! assert!(guard.check("search", &identity).unwrap().is_allowed());
//!
//! let mut session = guard.open_session(SessionRequest::default(), &identity);
//! assert!(session.set("theme", "dark"));
//! ```

use crate::application::audit::AuditLog;
use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::limiter::RateLimiter;
use crate::application::ports::{Clock, KvStore, LogSink};
use crate::application::session::{SecureSession, SessionManager, SessionRequest};
use crate::domain::identity::RequestIdentity;
use crate::domain::window::{LimitConfig, RateDecision};
use crate::error::ConfigError;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::{GuardConfig, StoreBackend};
use crate::infrastructure::file_sink::RotatingFileSink;
use crate::infrastructure::memory_store::MemoryStore;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Store shared by the limiter and the sessions.
pub type SharedStore = Arc<dyn KvStore>;

/// Rate limiter, session manager and audit log over one store.
#[derive(Debug, Clone)]
pub struct Guard {
    limiter: RateLimiter<SharedStore>,
    sessions: SessionManager<SharedStore>,
    audit: Arc<AuditLog>,
    limits: BTreeMap<String, LimitConfig>,
    salt: String,
}

impl Guard {
    /// Build every service from `config`, opening the configured store and
    /// log directory.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for invalid settings, an unreachable Redis
    /// server, a Redis backend without the `redis-storage` feature, or an
    /// unwritable log directory.
    pub fn from_config(config: &GuardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = open_store(config, Arc::clone(&clock))?;
        Self::with_store(config, store, clock)
    }

    /// All defaults with an in-memory store and no log file.
    pub fn in_memory() -> Result<Self, ConfigError> {
        Self::from_config(&GuardConfig::default())
    }

    /// Build every service over an existing store and clock.
    pub fn with_store(
        config: &GuardConfig,
        store: SharedStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut audit = AuditLog::builder()
            .with_min_level(config.audit.min_level)
            .with_max_context_len(config.audit.max_context_len)
            .with_clock(Arc::clone(&clock));
        if let Some(dir) = &config.audit.dir {
            let sink = RotatingFileSink::open_with_clock(
                dir,
                config.audit.file_sink_config(),
                Arc::clone(&clock),
            )
            .map_err(|e| ConfigError::Io(format!("{}: {}", dir.display(), e)))?;
            audit = audit.with_sink(Arc::new(sink) as Arc<dyn LogSink>);
        }
        let audit = Arc::new(audit.build()?);

        let rate = &config.rate_limit;
        let limiter = RateLimiter::builder(Arc::clone(&store))
            .with_clock(Arc::clone(&clock))
            .with_audit(Arc::clone(&audit))
            .with_backoff(rate.backoff()?)
            .with_identity_policy(rate.identity_policy)
            .with_key_prefix(rate.key_prefix.clone())
            .with_circuit_breaker_config(CircuitBreakerConfig {
                failure_threshold: rate.failure_threshold,
                recovery_timeout: Duration::from_secs(rate.recovery_timeout_secs),
            })
            .build()?;

        let sessions = SessionManager::new(store, config.session.to_session_config())?
            .with_clock(clock)
            .with_audit(Arc::clone(&audit));

        tracing::info!(
            backend = ?config.store.backend,
            actions = rate.actions.len(),
            audit_file = config.audit.dir.is_some(),
            "access guard ready"
        );

        Ok(Self {
            limiter,
            sessions,
            audit,
            limits: rate.limits()?,
            salt: config.identity.salt.clone(),
        })
    }

    /// Identity of a caller at `ip`, optionally authenticated as `user_id`.
    pub fn identify(&self, ip: IpAddr, user_id: Option<&str>) -> RequestIdentity {
        let identity = RequestIdentity::from_ip(ip, &self.salt);
        match user_id {
            Some(user) => identity.with_user(user),
            None => identity,
        }
    }

    /// Configured limit for `action`.
    pub fn limit(&self, action: &str) -> Option<&LimitConfig> {
        self.limits.get(action)
    }

    /// Rate limit `action` with its configured limit.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLimiter`] for an action with no limit.
    pub fn check(
        &self,
        action: &str,
        identity: &RequestIdentity,
    ) -> Result<RateDecision, ConfigError> {
        let config = self.limit(action).ok_or_else(|| {
            ConfigError::InvalidLimiter(format!("no limit configured for action {:?}", action))
        })?;
        Ok(self.limiter.check(action, identity, config))
    }

    /// Session for one request.
    pub fn open_session(
        &self,
        request: SessionRequest,
        identity: &RequestIdentity,
    ) -> SecureSession<SharedStore> {
        self.sessions.open(request, identity)
    }

    /// The shared rate limiter, for stats, resets and metrics.
    pub fn limiter(&self) -> &RateLimiter<SharedStore> {
        &self.limiter
    }

    /// The session manager behind [`open_session`](Self::open_session).
    pub fn sessions(&self) -> &SessionManager<SharedStore> {
        &self.sessions
    }

    /// The audit log every service writes to.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}

fn open_store(config: &GuardConfig, clock: Arc<dyn Clock>) -> Result<SharedStore, ConfigError> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(
            MemoryStore::with_clock(clock).with_purge_interval(config.store.purge_interval),
        )),
        #[cfg(feature = "redis-storage")]
        StoreBackend::Redis => {
            use crate::infrastructure::redis_store::{RedisStore, RedisStoreConfig};
            let store = RedisStore::connect(
                &config.store.url,
                RedisStoreConfig {
                    key_prefix: config.store.key_prefix.clone(),
                    connect_timeout: Duration::from_millis(config.store.connect_timeout_ms),
                    io_timeout: Duration::from_millis(config.store.io_timeout_ms),
                },
            )
            .map_err(|e| ConfigError::Store(e.to_string()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-storage"))]
        StoreBackend::Redis => Err(ConfigError::Store(
            "redis backend requires the `redis-storage` feature".to_string(),
        )),
    }
}
