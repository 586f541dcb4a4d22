//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Port for obtaining current time.
///
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Current time as unix seconds.
    fn unix_now(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Port for the shared TTL key-value store.
///
/// Every operation is a single-key operation and must return within a
/// bounded time; adapters turn timeouts into [`StoreError::Timeout`].
/// Infrastructure provides concrete implementations (MemoryStore, RedisStore).
pub trait KvStore: Send + Sync + Debug {
    /// Fetch the value under `key`, if present and not expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous value and TTL.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Delete `key`. Returns whether a live value was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add one to the counter under `key` and return the new value.
    ///
    /// A missing or expired counter starts at zero and receives `ttl`; an
    /// existing counter keeps its original expiry.
    fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Atomically replace the value under `key` if it still equals `expected`
    /// (`None` meaning "absent"). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

impl<T> KvStore for Arc<T>
where
    T: KvStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }

    fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        (**self).atomic_increment(key, ttl)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_swap(key, expected, new, ttl)
    }
}

/// A log file as reported to admin tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileInfo {
    /// Path relative to the log directory.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the filesystem reports one.
    pub modified_at: Option<DateTime<Utc>>,
}

/// Port for the durable destination of audit entries.
pub trait LogSink: Send + Sync + Debug {
    /// Append one already-serialised line. The sink adds the line terminator.
    fn write_line(&self, line: &str) -> std::io::Result<()>;

    /// Files currently managed by the sink, active file first.
    fn list_files(&self) -> std::io::Result<Vec<LogFileInfo>>;
}
