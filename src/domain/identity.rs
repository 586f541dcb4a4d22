//! Per-request caller identity.
//!
//! The dispatch layer builds one [`RequestIdentity`] per request and passes
//! it to the rate limiter and the session. Network addresses are never kept
//! in the clear: they are hashed with a deployment salt (SHA-256, first 16
//! bytes, hex) before anything else sees them. User ids are hashed the same
//! way before they reach a store key or the audit log.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

const ADDRESS_DOMAIN: u8 = 0;
const USER_DOMAIN: u8 = 1;

/// How the rate limiter derives its caller key from a [`RequestIdentity`].
///
/// Limits are applied to exactly one kind of key per deployment, so
/// authenticated and anonymous callers are never counted under two schemes
/// at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Every caller is keyed by hashed network address. Logged-in users share
    /// the budget of their address.
    #[default]
    AddressOnly,
    /// Authenticated callers are keyed by user id; anonymous ones by address.
    UserWhenAuthenticated,
}

/// Caller identity for one request.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    address_hash: String,
    user: Option<User>,
    salt: Arc<str>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct User {
    id: String,
    hash: String,
}

impl RequestIdentity {
    /// Identity for a peer address.
    pub fn from_ip(ip: IpAddr, salt: &str) -> Self {
        Self::from_address(&ip.to_string(), salt)
    }

    /// Identity for an address given as text (e.g. a forwarded header value).
    pub fn from_address(address: &str, salt: &str) -> Self {
        Self {
            address_hash: salted_hash(salt, ADDRESS_DOMAIN, address.trim()),
            user: None,
            salt: Arc::from(salt),
        }
    }

    /// Attach the authenticated user id, hashed with the same salt as the
    /// address.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        let id = user_id.into();
        let hash = salted_hash(&self.salt, USER_DOMAIN, &id);
        self.user = Some(User { id, hash });
        self
    }

    /// Salted hash of the caller's address.
    pub fn address_hash(&self) -> &str {
        &self.address_hash
    }

    /// Authenticated user id, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.id.as_str())
    }

    /// Salted hash of the authenticated user id, if any.
    pub fn user_hash(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.hash.as_str())
    }

    /// Check if the caller is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Key fragment the rate limiter counts this caller under.
    ///
    /// Always `a:` or `u:` followed by 32 hex digits, whatever the user id
    /// contains.
    pub fn limiter_subject(&self, policy: IdentityPolicy) -> String {
        match (policy, &self.user) {
            (IdentityPolicy::UserWhenAuthenticated, Some(user)) => format!("u:{}", user.hash),
            _ => format!("a:{}", self.address_hash),
        }
    }
}

impl fmt::Debug for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIdentity")
            .field("address_hash", &self.address_hash)
            .field("authenticated", &self.user.is_some())
            .finish()
    }
}

fn salted_hash(salt: &str, domain: u8, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([domain]);
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
