//! Session records.
//!
//! A [`SessionRecord`] is the whole server-side state of one visitor session.
//! It is stored as JSON under an opaque, random session id; the cookie only
//! ever carries that id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key holding the user agent the session was created with.
pub const USER_AGENT_KEY: &str = "user_agent";
/// Key holding the hashed address the session was created from.
pub const IP_ADDRESS_KEY: &str = "ip_address";
/// Key holding the anti-forgery token.
pub const SESSION_TOKEN_KEY: &str = "session_token";
/// Key holding the creation time.
pub const SESSION_START_KEY: &str = "session_start_time";

/// Keys that public writes may never touch.
pub const PROTECTED_KEYS: [&str; 4] = [
    USER_AGENT_KEY,
    IP_ADDRESS_KEY,
    SESSION_TOKEN_KEY,
    SESSION_START_KEY,
];

/// Length of an encoded session id or token (32 bytes, base64 without padding).
pub const SECRET_LEN: usize = 43;

const MAX_USER_AGENT_LEN: usize = 512;

/// Check if `key` is one of the [`PROTECTED_KEYS`].
pub fn is_protected(key: &str) -> bool {
    PROTECTED_KEYS.contains(&key)
}

/// Check if a cookie value could be a session id we issued.
///
/// Lets obviously forged cookies be dropped without a store lookup.
pub fn is_well_formed_id(value: &str) -> bool {
    value.len() == SECRET_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Server-side session state.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Creation time (unix seconds).
    pub created_at: u64,
    /// Last read or write (unix seconds).
    pub last_activity: u64,
    data: BTreeMap<String, Value>,
}

impl SessionRecord {
    /// A new record with its protected keys filled in.
    pub fn new(now: u64, token: String, user_agent: Option<&str>, address_hash: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert(SESSION_TOKEN_KEY.to_string(), Value::String(token));
        data.insert(
            IP_ADDRESS_KEY.to_string(),
            Value::String(address_hash.to_string()),
        );
        data.insert(SESSION_START_KEY.to_string(), Value::from(now));
        if let Some(agent) = user_agent {
            data.insert(
                USER_AGENT_KEY.to_string(),
                Value::String(agent.chars().take(MAX_USER_AGENT_LEN).collect()),
            );
        }
        Self {
            created_at: now,
            last_activity: now,
            data,
        }
    }

    /// The anti-forgery token.
    pub fn token(&self) -> Option<&str> {
        self.data.get(SESSION_TOKEN_KEY).and_then(Value::as_str)
    }

    /// Check if `user_agent` matches the one recorded at creation.
    pub fn matches_user_agent(&self, user_agent: Option<&str>) -> bool {
        let stored = self.data.get(USER_AGENT_KEY).and_then(Value::as_str);
        let presented =
            user_agent.map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect::<String>());
        stored == presented.as_deref()
    }

    /// Mark activity at `now`.
    pub fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Stored value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Store `value` under a non-protected key.
    ///
    /// Returns `false` and leaves the record unchanged for protected keys.
    pub fn insert(&mut self, key: &str, value: Value) -> bool {
        if is_protected(key) {
            return false;
        }
        self.data.insert(key.to_string(), value);
        true
    }

    /// Remove a non-protected key; returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        if is_protected(key) {
            return false;
        }
        self.data.remove(key).is_some()
    }

    /// Number of stored keys, protected ones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the record holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.data.keys().map(String::as_str).collect();
        f.debug_struct("SessionRecord")
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .field("keys", &keys)
            .finish()
    }
}

/// Diagnostic snapshot of a session. Holds no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Whether a live session backs this request.
    pub session_active: bool,
    /// Creation time of the session.
    pub created_at: Option<u64>,
    /// Last activity on the session.
    pub last_activity: Option<u64>,
    /// Whether the request arrived over an encrypted connection.
    pub is_encrypted_connection: bool,
    /// Version of this library.
    pub runtime_version: &'static str,
}
