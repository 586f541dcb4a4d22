//! Cache-backed visitor sessions with protected keys and an anti-forgery
//! token.
//!
//! A [`SessionManager`] is built once per process. For every request the
//! dispatch layer calls [`SessionManager::open`] and works with the returned
//! [`SecureSession`], which loads or creates the backing record on first use.
//!
//! Store failures never abort a request: reads fall back to the caller's
//! default, writes report `false`, and an ERROR audit entry is written.

use crate::application::audit::AuditLog;
use crate::application::ports::{Clock, KvStore};
use crate::domain::identity::RequestIdentity;
use crate::domain::session::{is_well_formed_id, SessionInfo, SessionRecord};
use crate::domain::window::RateDecision;
use crate::error::{ConfigError, StoreError};
use crate::infrastructure::clock::SystemClock;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const AUDIT_CATEGORY: &str = "session";
const MAX_CAS_ATTEMPTS: usize = 8;

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Idle lifetime; every access slides it.
    pub ttl: Duration,
    /// Prefix of record keys in the store.
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "vg_session".to_string(),
            ttl: Duration::from_secs(1440),
            key_prefix: "sess:".to_string(),
        }
    }
}

impl SessionConfig {
    /// Check the settings.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidSession`] for an empty or non-token
    /// cookie name, an empty key prefix, or a TTL under one second.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_name = !self.cookie_name.is_empty()
            && self
                .cookie_name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if !valid_name {
            return Err(ConfigError::InvalidSession(format!(
                "invalid cookie name {:?}",
                self.cookie_name
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidSession(
                "key prefix must not be empty".to_string(),
            ));
        }
        if self.ttl.as_secs() == 0 {
            return Err(ConfigError::InvalidSession(
                "ttl must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// The parts of an incoming request the session needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Value of the session cookie, if the browser sent one.
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    /// Whether the request arrived over TLS.
    pub encrypted: bool,
}

/// A `Set-Cookie` the dispatch layer must send with the response.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub secure: bool,
    removal: bool,
}

impl SessionCookie {
    /// Check if this cookie clears the session cookie in the browser.
    pub fn is_removal(&self) -> bool {
        self.removal
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut header = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.name, self.value
        );
        if self.removal {
            header.push_str("; Max-Age=0");
        }
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .field("secure", &self.secure)
            .field("removal", &self.removal)
            .finish_non_exhaustive()
    }
}

/// Generic rejection shown to the visitor. Carries no internal detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SecurityRejection {
    /// Missing or wrong anti-forgery token, or no session.
    #[error("security check failed, please reload the page")]
    CheckFailed,
    /// The caller is rate limited.
    #[error("too many requests, retry in {retry_after_secs} seconds")]
    TooManyRequests { retry_after_secs: u64 },
}

impl SecurityRejection {
    /// HTTP status matching the rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            SecurityRejection::CheckFailed => 403,
            SecurityRejection::TooManyRequests { .. } => 429,
        }
    }

    /// `Retry-After` value, for rate limit rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SecurityRejection::CheckFailed => None,
            SecurityRejection::TooManyRequests { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

impl RateDecision {
    /// Turn a limiter decision into a result the dispatch layer can `?`.
    pub fn into_result(self) -> Result<u32, SecurityRejection> {
        match self {
            RateDecision::Allowed { remaining } => Ok(remaining),
            RateDecision::Limited { .. } => Err(SecurityRejection::TooManyRequests {
                retry_after_secs: self.retry_after_secs().unwrap_or(1),
            }),
        }
    }
}

/// Creates per-request sessions over a shared store.
#[derive(Debug, Clone)]
pub struct SessionManager<S>
where
    S: KvStore + Clone,
{
    store: S,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    config: SessionConfig,
}

impl<S> SessionManager<S>
where
    S: KvStore + Clone,
{
    /// Create a manager with the system clock and a tracing-only audit log.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidSession`] if `config` is invalid.
    pub fn new(store: S, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock::new()),
            audit: Arc::new(AuditLog::tracing_only()),
            config,
        })
    }

    /// Time source for session timestamps (default: system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Audit log receiving hijack, protected-key and outage entries
    /// (default: tracing only).
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Validated session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session for one request. Nothing touches the store until first use.
    pub fn open(&self, request: SessionRequest, identity: &RequestIdentity) -> SecureSession<S> {
        SecureSession {
            manager: self.clone(),
            request,
            address_hash: identity.address_hash().to_string(),
            state: SessionState::Uninitialized,
            pending_cookie: None,
        }
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }
}

enum SessionState {
    Uninitialized,
    /// The visitor has no session and none has been created yet.
    Absent,
    Active { id: String, record: SessionRecord },
    /// The store failed during initialisation.
    Unavailable,
    Destroyed,
}

/// One visitor session, bound to a single request.
pub struct SecureSession<S>
where
    S: KvStore + Clone,
{
    manager: SessionManager<S>,
    request: SessionRequest,
    address_hash: String,
    state: SessionState,
    pending_cookie: Option<SessionCookie>,
}

impl<S> SecureSession<S>
where
    S: KvStore + Clone,
{
    /// Stored value for `key`, or `default` when absent, undecodable, or the
    /// store is unavailable.
    pub fn get<T>(&mut self, key: &str, default: T) -> T
    where
        T: DeserializeOwned,
    {
        self.init(true);
        match &self.state {
            SessionState::Active { record, .. } => record
                .get(key)
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or(default),
            _ => default,
        }
    }

    /// Store `value` under `key`.
    ///
    /// Returns `false` for protected keys, when the value cannot be
    /// serialised, or when the store is unavailable.
    pub fn set<T>(&mut self, key: &str, value: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        if crate::domain::session::is_protected(key) {
            self.manager.audit.info(
                AUDIT_CATEGORY,
                "write to protected session key refused",
                &[("key", key.to_string())],
            );
            return false;
        }
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(key, error = %err, "session value not serialisable");
                return false;
            }
        };
        self.init(true);
        self.mutate("set", |record| record.insert(key, value.clone()))
    }

    /// Delete `key`. Returns `false` for protected or absent keys.
    pub fn remove(&mut self, key: &str) -> bool {
        self.init(true);
        let present = matches!(
            &self.state,
            SessionState::Active { record, .. } if record.get(key).is_some()
        );
        present && self.mutate("remove", |record| record.remove(key))
    }

    /// The anti-forgery token, creating the session if needed.
    pub fn get_token(&mut self) -> Option<String> {
        self.init(true);
        match &self.state {
            SessionState::Active { record, .. } => record.token().map(str::to_string),
            _ => None,
        }
    }

    /// Compare `candidate` with the session token in constant time.
    ///
    /// Never creates a session: a visitor without one fails the check.
    pub fn verify_token(&mut self, candidate: &str) -> bool {
        self.init(false);
        match &self.state {
            SessionState::Active { record, .. } => record
                .token()
                .map(|token| constant_time_eq(token.as_bytes(), candidate.as_bytes()))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// [`verify_token`](Self::verify_token) as a result for the dispatch layer.
    pub fn require_token(&mut self, candidate: Option<&str>) -> Result<(), SecurityRejection> {
        match candidate {
            Some(candidate) if self.verify_token(candidate) => Ok(()),
            _ => Err(SecurityRejection::CheckFailed),
        }
    }

    /// Delete the session and clear the cookie.
    pub fn destroy_session(&mut self) {
        self.init(false);
        let state = std::mem::replace(&mut self.state, SessionState::Destroyed);
        if let SessionState::Active { id, .. } = state {
            if let Err(err) = self.manager.store.delete(&self.manager.record_key(&id)) {
                self.store_failed("destroy", &err);
            }
        }
        if self.request.cookie.is_some() || self.pending_cookie.is_some() {
            self.pending_cookie = Some(self.cookie(String::new(), true));
        }
    }

    /// Diagnostic snapshot. Loads an existing session but never creates one.
    pub fn get_session_info(&mut self) -> SessionInfo {
        self.init(false);
        let record = match &self.state {
            SessionState::Active { record, .. } => Some(record),
            _ => None,
        };
        SessionInfo {
            session_active: record.is_some(),
            created_at: record.map(|r| r.created_at),
            last_activity: record.map(|r| r.last_activity),
            is_encrypted_connection: self.request.encrypted,
            runtime_version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// The cookie to send with the response, if the session changed it.
    pub fn pending_cookie(&self) -> Option<&SessionCookie> {
        self.pending_cookie.as_ref()
    }

    /// Take the pending cookie, leaving none behind.
    pub fn take_cookie(&mut self) -> Option<SessionCookie> {
        self.pending_cookie.take()
    }

    /// Id of the live session, if one is loaded.
    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Active { id, .. } => Some(id),
            _ => None,
        }
    }

    fn init(&mut self, create: bool) {
        if matches!(self.state, SessionState::Uninitialized) {
            self.state = match self.load_existing() {
                Ok(Some((id, record))) => SessionState::Active { id, record },
                Ok(None) => SessionState::Absent,
                Err(err) => {
                    self.store_failed("load", &err);
                    SessionState::Unavailable
                }
            };
        }
        if create && matches!(self.state, SessionState::Absent) {
            self.state = match self.create() {
                Ok((id, record)) => {
                    self.pending_cookie = Some(self.cookie(id.clone(), false));
                    SessionState::Active { id, record }
                }
                Err(err) => {
                    self.store_failed("create", &err);
                    SessionState::Unavailable
                }
            };
        }
    }

    fn load_existing(&self) -> Result<Option<(String, SessionRecord)>, StoreError> {
        let Some(id) = self.request.cookie.as_deref().filter(|c| is_well_formed_id(c)) else {
            return Ok(None);
        };
        let id = id.to_string();
        let key = self.manager.record_key(&id);
        let Some(raw) = self.manager.store.get(&key)? else {
            return Ok(None);
        };
        let mut record: SessionRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "discarding undecodable session record");
                self.manager.store.delete(&key)?;
                return Ok(None);
            }
        };

        if !record.matches_user_agent(self.request.user_agent.as_deref()) {
            self.manager.store.delete(&key)?;
            self.manager.audit.warning(
                AUDIT_CATEGORY,
                "session fingerprint mismatch, session discarded",
                &[
                    ("reason", "user_agent_mismatch".to_string()),
                    ("address", self.address_hash.clone()),
                ],
            );
            return Ok(None);
        }

        record.touch(self.manager.clock.unix_now());
        let bytes = serde_json::to_vec(&record)?;
        // Slide the TTL; a concurrent writer refreshing it as well is fine
        self.manager
            .store
            .compare_and_swap(&key, Some(&raw), &bytes, self.manager.config.ttl)?;
        Ok(Some((id, record)))
    }

    fn create(&self) -> Result<(String, SessionRecord), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let id = random_secret();
            let mut token = random_secret();
            while token == id {
                token = random_secret();
            }
            let record = SessionRecord::new(
                self.manager.clock.unix_now(),
                token,
                self.request.user_agent.as_deref(),
                &self.address_hash,
            );
            let bytes = serde_json::to_vec(&record)?;
            if self.manager.store.compare_and_swap(
                &self.manager.record_key(&id),
                None,
                &bytes,
                self.manager.config.ttl,
            )? {
                tracing::debug!("session created");
                return Ok((id, record));
            }
        }
        Err(StoreError::Contention)
    }

    /// Apply `change` to the stored record with compare-and-swap.
    ///
    /// `change` returns whether it modified the record.
    fn mutate<F>(&mut self, operation: &str, change: F) -> bool
    where
        F: Fn(&mut SessionRecord) -> bool,
    {
        let key = match &self.state {
            SessionState::Active { id, .. } => self.manager.record_key(id),
            _ => return false,
        };

        match self.swap_record(&key, change) {
            Ok(Some((record, changed))) => {
                if let SessionState::Active { record: cached, .. } = &mut self.state {
                    *cached = record;
                }
                changed
            }
            Ok(None) => {
                tracing::debug!(operation, "session expired during request");
                false
            }
            Err(err) => {
                self.store_failed(operation, &err);
                false
            }
        }
    }

    fn swap_record<F>(
        &self,
        key: &str,
        change: F,
    ) -> Result<Option<(SessionRecord, bool)>, StoreError>
    where
        F: Fn(&mut SessionRecord) -> bool,
    {
        let store = &self.manager.store;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(raw) = store.get(key)? else {
                return Ok(None);
            };
            let mut record: SessionRecord = serde_json::from_slice(&raw)?;
            if !change(&mut record) {
                return Ok(Some((record, false)));
            }
            record.touch(self.manager.clock.unix_now());
            let bytes = serde_json::to_vec(&record)?;
            if store.compare_and_swap(key, Some(&raw), &bytes, self.manager.config.ttl)? {
                return Ok(Some((record, true)));
            }
        }
        Err(StoreError::Contention)
    }

    fn cookie(&self, value: String, removal: bool) -> SessionCookie {
        SessionCookie {
            name: self.manager.config.cookie_name.clone(),
            value,
            secure: self.request.encrypted,
            removal,
        }
    }

    fn store_failed(&self, operation: &str, err: &StoreError) {
        tracing::warn!(operation, error = %err, "session store failed");
        self.manager.audit.error(
            AUDIT_CATEGORY,
            "session store unavailable",
            &[("operation", operation.to_string()), ("error", err.to_string())],
        );
    }
}

impl<S> fmt::Debug for SecureSession<S>
where
    S: KvStore + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Absent => "absent",
            SessionState::Active { .. } => "active",
            SessionState::Unavailable => "unavailable",
            SessionState::Destroyed => "destroyed",
        };
        f.debug_struct("SecureSession")
            .field("state", &state)
            .field("encrypted", &self.request.encrypted)
            .finish_non_exhaustive()
    }
}

/// 32 bytes from the OS RNG, base64 URL-safe without padding.
fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::{SECRET_LEN, SESSION_TOKEN_KEY};
    use crate::infrastructure::memory_store::MemoryStore;

    fn manager() -> SessionManager<Arc<MemoryStore>> {
        SessionManager::new(Arc::new(MemoryStore::new()), SessionConfig::default()).unwrap()
    }

    fn request(cookie: Option<String>) -> SessionRequest {
        SessionRequest {
            cookie,
            user_agent: Some("Firefox".to_string()),
            encrypted: true,
        }
    }

    fn identity() -> RequestIdentity {
        RequestIdentity::from_address("198.51.100.4", "salt")
    }

    #[test]
    fn test_secrets_are_url_safe_and_distinct() {
        let a = random_secret();
        let b = random_secret();
        assert_eq!(a.len(), SECRET_LEN);
        assert!(is_well_formed_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_new_session_sets_cookie() {
        let manager = manager();
        let mut session = manager.open(request(None), &identity());
        assert!(session.pending_cookie().is_none());

        let token = session.get_token().unwrap();
        let cookie = session.pending_cookie().unwrap();
        assert_eq!(cookie.name, "vg_session");
        assert_eq!(cookie.value.len(), SECRET_LEN);
        assert_ne!(cookie.value, token);
        assert_eq!(
            cookie.to_header_value(),
            format!("vg_session={}; Path=/; HttpOnly; SameSite=Lax; Secure", cookie.value)
        );
    }

    #[test]
    fn test_verify_token_does_not_create_session() {
        let manager = manager();
        let mut session = manager.open(request(None), &identity());
        assert!(!session.verify_token("anything"));
        assert!(session.pending_cookie().is_none());
        assert!(!session.get_session_info().session_active);
    }

    #[test]
    fn test_session_survives_across_requests() {
        let manager = manager();
        let mut first = manager.open(request(None), &identity());
        assert!(first.set("theme", "dark"));
        let token = first.get_token().unwrap();
        let cookie = first.take_cookie().unwrap();

        let mut second = manager.open(request(Some(cookie.value)), &identity());
        assert_eq!(second.get("theme", String::new()), "dark");
        assert!(second.verify_token(&token));
        assert!(second.pending_cookie().is_none());
    }

    #[test]
    fn test_protected_keys_refused() {
        let manager = manager();
        let mut session = manager.open(request(None), &identity());
        let token = session.get_token().unwrap();
        assert!(!session.set(SESSION_TOKEN_KEY, "forged"));
        assert!(!session.remove(SESSION_TOKEN_KEY));
        assert_eq!(session.get_token(), Some(token));
    }

    #[test]
    fn test_malformed_cookie_is_ignored() {
        let manager = manager();
        let mut session = manager.open(request(Some("../../etc".to_string())), &identity());
        assert!(!session.get_session_info().session_active);
        assert!(session.get_token().is_some());
        assert!(session.pending_cookie().is_some());
    }

    #[test]
    fn test_destroy_emits_removal_cookie() {
        let manager = manager();
        let mut session = manager.open(request(None), &identity());
        let token = session.get_token().unwrap();
        session.destroy_session();

        assert!(!session.verify_token(&token));
        let cookie = session.pending_cookie().unwrap();
        assert!(cookie.is_removal());
        assert!(cookie.to_header_value().contains("Max-Age=0"));
        assert!(!session.set("theme", "dark"));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(SecurityRejection::CheckFailed.status_code(), 403);
        let limited = RateDecision::Limited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            limited.into_result(),
            Err(SecurityRejection::TooManyRequests { retry_after_secs: 2 })
        );
        assert_eq!(RateDecision::Allowed { remaining: 3 }.into_result(), Ok(3));
    }

    #[test]
    fn test_invalid_config() {
        let config = SessionConfig {
            cookie_name: "bad name;".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSession(_))));
    }
}
