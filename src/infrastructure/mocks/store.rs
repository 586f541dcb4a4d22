//! Store doubles for exercising the failure paths.

use crate::application::ports::{Clock, KvStore};
use crate::error::StoreError;
use crate::infrastructure::memory_store::MemoryStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A store that is always down.
#[derive(Debug, Clone)]
pub struct FailingStore {
    error: StoreError,
}

impl FailingStore {
    /// Every call fails with `StoreError::Unavailable`.
    pub fn new() -> Self {
        Self::with_error(StoreError::Unavailable("connection refused".to_string()))
    }

    /// Every call fails with `error`.
    pub fn with_error(error: StoreError) -> Self {
        Self { error }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(self.error.clone())
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
        Err(self.error.clone())
    }

    fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(self.error.clone())
    }

    fn atomic_increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        Err(self.error.clone())
    }

    fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&[u8]>,
        _new: &[u8],
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(self.error.clone())
    }
}

/// A working in-memory store that can be taken down and brought back.
///
/// Counts the calls that reached it, so tests can tell whether a caller
/// skipped the store entirely.
#[derive(Debug, Clone)]
pub struct SwitchableStore {
    inner: Arc<MemoryStore>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl SwitchableStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryStore::with_clock(clock)),
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every following call fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls made so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl KvStore for SwitchableStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.enter()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.enter()?;
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter()?;
        self.inner.delete(key)
    }

    fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.enter()?;
        self.inner.atomic_increment(key, ttl)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.enter()?;
        self.inner.compare_and_swap(key, expected, new, ttl)
    }
}
