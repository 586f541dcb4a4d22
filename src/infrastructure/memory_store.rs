//! In-process TTL key-value store.
//!
//! Backed by a sharded `DashMap`. The atomic operations hold the shard lock
//! of their key through DashMap's entry API, so increments and
//! compare-and-swap are atomic with respect to every other call on the same
//! store. Suitable for single-process deployments and tests; use the Redis
//! store to share state between processes.
//!
//! Every `purge_interval` writes the store sweeps out expired entries, so
//! keys nobody touches again (old window counters, abandoned sessions) do
//! not accumulate.

use crate::application::ports::{Clock, KvStore};
use crate::error::StoreError;
use crate::infrastructure::clock::SystemClock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: SystemTime,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, now: SystemTime, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// Writes between two sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Thread-safe TTL store backed by DashMap.
///
/// Expired entries are invisible to every operation. They are dropped
/// lazily when touched, in a sweep every `purge_interval` writes, or on
/// demand by [`purge_expired`](Self::purge_expired). The map therefore
/// never holds more than the live entries plus one interval's worth of
/// expired ones.
#[derive(Debug)]
pub struct MemoryStore {
    map: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            map: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    /// Sweep expired entries every `writes` writes (default: 1024).
    ///
    /// Values below 1 are treated as 1.
    pub fn with_purge_interval(mut self, writes: u64) -> Self {
        self.purge_interval = writes.max(1);
        self
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.map.len();
        self.map.retain(|_, value| value.is_live(now));
        before.saturating_sub(self.map.len())
    }

    /// Count a write and sweep once per interval.
    ///
    /// Must run before the caller takes any shard lock: `retain` locks
    /// every shard in turn.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, remaining = self.map.len(), "purged expired entries");
            }
        }
    }

    /// Number of entries, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .get(key)
            .filter(|value| value.is_live(now))
            .map(|value| value.bytes.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.record_write();
        let now = self.clock.now();
        self.map
            .insert(key.to_string(), StoredValue::new(value.to_vec(), now, ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .map
            .remove(key)
            .map(|(_, value)| value.is_live(now))
            .unwrap_or(false))
    }

    fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.record_write();
        let now = self.clock.now();
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let stored = occupied.get_mut();
                let current: u64 = std::str::from_utf8(&stored.bytes)
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| {
                        StoreError::Serialization(format!("value under {} is not a counter", key))
                    })?;
                let next = current.saturating_add(1);
                stored.bytes = next.to_string().into_bytes();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(StoredValue::new(b"1".to_vec(), now, ttl));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(b"1".to_vec(), now, ttl));
                Ok(1)
            }
        }
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.record_write();
        let now = self.clock.now();
        let replacement = StoredValue::new(new.to_vec(), now, ttl);
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|value| value.is_live(now))
                    .map(|value| value.bytes.as_slice());
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
                Ok(true)
            }
        }
    }
}
