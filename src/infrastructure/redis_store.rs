//! Redis-backed store.
//!
//! Shares rate windows, counters and sessions between every process of a
//! deployment.
//!
//! ## Architecture
//!
//! - Keys are prefixed with a configurable namespace (default `access-guard:`)
//! - TTLs are set in milliseconds (`PX` / `PEXPIRE`)
//! - `atomic_increment` and `compare_and_swap` run as Lua scripts, so each is
//!   a single atomic step on the server
//! - One synchronous connection guarded by a mutex, with connect, read and
//!   write timeouts; a broken connection is dropped and re-opened on the
//!   next call
//!
//! ## Example
//!
//! ```rust,ignore
//! use access_guard::{RedisStore, RedisStoreConfig, RateLimiter};
//!
//! let store = RedisStore::connect("redis://127.0.0.1/", RedisStoreConfig::default())
//!     .expect("Failed to connect to Redis");
//! let limiter = RateLimiter::builder(store).build()?;
//! ```

use crate::application::ports::KvStore;
use crate::error::StoreError;
use redis::{Client, Connection, RedisError, Script};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const INCREMENT_SCRIPT: &str = r"
local value = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

const COMPARE_AND_SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
";

/// Configuration for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    /// Key prefix for Redis keys (default: "access-guard:")
    pub key_prefix: String,
    /// Maximum time to establish a connection (default: 500 ms)
    pub connect_timeout: Duration,
    /// Maximum time for a single command (default: 250 ms)
    pub io_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "access-guard:".to_string(),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(250),
        }
    }
}

/// Redis-backed [`KvStore`].
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: Arc<Mutex<Option<Connection>>>,
    config: RedisStoreConfig,
    increment: Arc<Script>,
    compare_and_swap: Arc<Script>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    /// * `config` - Store configuration
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the first connection fails.
    pub fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_error)?;
        let store = Self {
            client,
            connection: Arc::new(Mutex::new(None)),
            config,
            increment: Arc::new(Script::new(INCREMENT_SCRIPT)),
            compare_and_swap: Arc::new(Script::new(COMPARE_AND_SWAP_SCRIPT)),
        };
        {
            let mut slot = store.lock();
            *slot = Some(store.open_connection()?);
        }
        Ok(store)
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let connection = self
            .client
            .get_connection_with_timeout(self.config.connect_timeout)
            .map_err(map_error)?;
        connection
            .set_read_timeout(Some(self.config.io_timeout))
            .map_err(map_error)?;
        connection
            .set_write_timeout(Some(self.config.io_timeout))
            .map_err(map_error)?;
        Ok(connection)
    }

    /// Run `op` on the shared connection, reconnecting first if needed.
    fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RedisError>,
    {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(self.open_connection()?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(StoreError::Unavailable("no connection".to_string()));
        };

        op(connection).map_err(|err| {
            if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
                tracing::warn!(error = %err, "redis connection dropped");
                *slot = None;
            }
            map_error(err)
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

impl KvStore for RedisStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.key(key);
        self.with_connection(|conn| redis::cmd("GET").arg(&key).query(conn))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let key = self.key(key);
        self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query(conn)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let removed: u64 = self.with_connection(|conn| redis::cmd("DEL").arg(&key).query(conn))?;
        Ok(removed > 0)
    }

    fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let key = self.key(key);
        let script = Arc::clone(&self.increment);
        self.with_connection(|conn| script.key(&key).arg(ttl_millis(ttl)).invoke(conn))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.key(key);
        let script = Arc::clone(&self.compare_and_swap);
        let swapped: i64 = self.with_connection(|conn| {
            script
                .key(&key)
                .arg(if expected.is_some() { "1" } else { "0" })
                .arg(expected.unwrap_or_default())
                .arg(new)
                .arg(ttl_millis(ttl))
                .invoke(conn)
        })?;
        Ok(swapped == 1)
    }
}
