//! Deployment configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [identity]
//! salt = "change-me"
//!
//! [rate_limit.actions.search]
//! limit = 10
//! window_secs = 60
//!
//! [audit]
//! dir = "/var/log/access-guard"
//! min_level = "warning"
//! ```

use crate::application::session::SessionConfig;
use crate::domain::entry::LogLevel;
use crate::domain::identity::IdentityPolicy;
use crate::domain::window::{BackoffPolicy, LimitConfig};
use crate::error::ConfigError;
use crate::infrastructure::file_sink::FileSinkConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Caller identity settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Salt mixed into address hashes (default: empty, which logs a warning)
    #[serde(default)]
    pub salt: String,
}

/// Which store backs the limiter and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process DashMap store
    #[default]
    Memory,
    /// Shared Redis store (feature `redis-storage`)
    Redis,
}

/// Store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Backend (default: memory)
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis URL (default: redis://127.0.0.1/)
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix for Redis keys (default: access-guard:)
    #[serde(default = "default_store_prefix")]
    pub key_prefix: String,
    /// Connect timeout in milliseconds (default: 500)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command timeout in milliseconds (default: 250)
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Memory backend: writes between sweeps of expired keys (default: 1024)
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            key_prefix: default_store_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            purge_interval: default_purge_interval(),
        }
    }
}

/// Limit for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionLimit {
    pub limit: u32,
    /// Window length in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl ActionLimit {
    pub fn to_limit_config(&self) -> Result<LimitConfig, ConfigError> {
        LimitConfig::new(self.limit, Duration::from_secs(self.window_secs))
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Key prefix (default: rl:)
    #[serde(default = "default_rate_prefix")]
    pub key_prefix: String,
    /// How callers are keyed (default: address_only)
    #[serde(default)]
    pub identity_policy: IdentityPolicy,
    /// First block length in seconds (default: 60)
    #[serde(default = "default_base_block_secs")]
    pub base_block_secs: u64,
    /// Longest block in seconds (default: 3600)
    #[serde(default = "default_max_block_secs")]
    pub max_block_secs: u64,
    /// Violation-free time after which escalation resets (default: 86400)
    #[serde(default = "default_decay_horizon_secs")]
    pub decay_horizon_secs: u64,
    /// Consecutive store failures before the circuit opens (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds before a store probe after the circuit opened (default: 30)
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Limits per action (default: search, pagination, share)
    #[serde(default = "default_actions")]
    pub actions: BTreeMap<String, ActionLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_prefix(),
            identity_policy: IdentityPolicy::default(),
            base_block_secs: default_base_block_secs(),
            max_block_secs: default_max_block_secs(),
            decay_horizon_secs: default_decay_horizon_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            actions: default_actions(),
        }
    }
}

impl RateLimitConfig {
    pub fn backoff(&self) -> Result<BackoffPolicy, ConfigError> {
        BackoffPolicy::new(
            Duration::from_secs(self.base_block_secs),
            Duration::from_secs(self.max_block_secs),
            Duration::from_secs(self.decay_horizon_secs),
        )
    }

    /// Validated limits per action.
    pub fn limits(&self) -> Result<BTreeMap<String, LimitConfig>, ConfigError> {
        self.actions
            .iter()
            .map(|(action, limit)| Ok((action.clone(), limit.to_limit_config()?)))
            .collect()
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Cookie name (default: vg_session)
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Sliding idle lifetime in seconds (default: 1440)
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Key prefix (default: sess:)
    #[serde(default = "default_session_prefix")]
    pub key_prefix: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_secs: default_session_ttl_secs(),
            key_prefix: default_session_prefix(),
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            cookie_name: self.cookie_name.clone(),
            ttl: Duration::from_secs(self.ttl_secs),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Log directory; without one, entries only go to `tracing`
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// File name stem (default: access-guard)
    #[serde(default = "default_stem")]
    pub stem: String,
    /// Lowest level recorded (default: info)
    #[serde(default = "default_min_level")]
    pub min_level: LogLevel,
    /// Rotation threshold in bytes (default: 5 MiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Rotated files kept (default: 5)
    #[serde(default = "default_max_rotated_files")]
    pub max_rotated_files: usize,
    /// Longest context value before truncation (default: 256)
    #[serde(default = "default_max_context_len")]
    pub max_context_len: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: None,
            stem: default_stem(),
            min_level: default_min_level(),
            max_file_size: default_max_file_size(),
            max_rotated_files: default_max_rotated_files(),
            max_context_len: default_max_context_len(),
        }
    }
}

impl AuditConfig {
    pub fn file_sink_config(&self) -> FileSinkConfig {
        FileSinkConfig {
            stem: self.stem.clone(),
            max_file_size: self.max_file_size,
            max_rotated_files: self.max_rotated_files,
        }
    }
}

impl GuardConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown fields,
    /// or any validation error from [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GuardConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Check every section for values the services would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.backoff()?;
        self.rate_limit.limits()?;
        if self.rate_limit.key_prefix.is_empty() {
            return Err(ConfigError::InvalidLimiter(
                "key prefix must not be empty".to_string(),
            ));
        }
        if self.rate_limit.failure_threshold == 0 {
            return Err(ConfigError::InvalidLimiter(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        self.session.to_session_config().validate()?;
        self.audit.file_sink_config().validate()?;
        if self.audit.max_context_len == 0 {
            return Err(ConfigError::InvalidAudit(
                "max_context_len must be greater than 0".to_string(),
            ));
        }
        if self.store.io_timeout_ms == 0 || self.store.connect_timeout_ms == 0 {
            return Err(ConfigError::Store(
                "store timeouts must be greater than 0".to_string(),
            ));
        }
        if self.store.purge_interval == 0 {
            return Err(ConfigError::Store(
                "purge_interval must be greater than 0".to_string(),
            ));
        }
        if self.identity.salt.is_empty() {
            tracing::warn!("identity salt is empty; address hashes are predictable");
        }
        Ok(())
    }
}

// Default value functions
fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_store_prefix() -> String {
    "access-guard:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_io_timeout_ms() -> u64 {
    250
}

fn default_purge_interval() -> u64 {
    crate::infrastructure::memory_store::DEFAULT_PURGE_INTERVAL
}

fn default_window_secs() -> u64 {
    60
}

fn default_rate_prefix() -> String {
    "rl:".to_string()
}

fn default_base_block_secs() -> u64 {
    60
}

fn default_max_block_secs() -> u64 {
    3600
}

fn default_decay_horizon_secs() -> u64 {
    86_400
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_actions() -> BTreeMap<String, ActionLimit> {
    [("search", 10), ("pagination", 30), ("share", 5)]
        .into_iter()
        .map(|(action, limit)| {
            (
                action.to_string(),
                ActionLimit {
                    limit,
                    window_secs: default_window_secs(),
                },
            )
        })
        .collect()
}

fn default_cookie_name() -> String {
    "vg_session".to_string()
}

fn default_session_ttl_secs() -> u64 {
    1440 // 24 minutes
}

fn default_session_prefix() -> String {
    "sess:".to_string()
}

fn default_stem() -> String {
    "access-guard".to_string()
}

fn default_min_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024
}

fn default_max_rotated_files() -> usize {
    5
}

fn default_max_context_len() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GuardConfig::from_toml_str("").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.rate_limit.actions["search"].limit, 10);
        assert_eq!(config.session.ttl_secs, 1440);
        assert_eq!(config.audit.min_level, LogLevel::Info);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.purge_interval, 1024);
    }

    #[test]
    fn test_partial_sections() {
        let config = GuardConfig::from_toml_str(
            r#"
            [identity]
            salt = "pepper"

            [rate_limit]
            identity_policy = "user_when_authenticated"
            base_block_secs = 30

            [rate_limit.actions.search]
            limit = 5

            [audit]
            dir = "/tmp/guard"
            min_level = "WARNING"
            "#,
        )
        .unwrap();

        assert_eq!(config.identity.salt, "pepper");
        assert_eq!(
            config.rate_limit.identity_policy,
            IdentityPolicy::UserWhenAuthenticated
        );
        assert_eq!(config.rate_limit.base_block_secs, 30);
        assert_eq!(config.rate_limit.max_block_secs, 3600);
        // An explicit table replaces the default action set
        assert_eq!(config.rate_limit.actions.len(), 1);
        assert_eq!(config.rate_limit.actions["search"].window_secs, 60);
        assert_eq!(config.audit.min_level, LogLevel::Warning);
        assert_eq!(config.audit.dir, Some(PathBuf::from("/tmp/guard")));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let zero_limit = "[rate_limit.actions.search]\nlimit = 0\n";
        assert_eq!(
            GuardConfig::from_toml_str(zero_limit),
            Err(ConfigError::InvalidLimit)
        );

        let inverted = "[rate_limit]\nbase_block_secs = 600\nmax_block_secs = 60\n";
        assert!(matches!(
            GuardConfig::from_toml_str(inverted),
            Err(ConfigError::InvalidBackoff(_))
        ));
    }

    #[test]
    fn test_zero_purge_interval_is_rejected() {
        assert!(matches!(
            GuardConfig::from_toml_str("[store]\npurge_interval = 0\n"),
            Err(ConfigError::Store(_))
        ));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(matches!(
            GuardConfig::from_toml_str("[session]\ncookie = \"x\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            GuardConfig::load("/nonexistent/access-guard.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
