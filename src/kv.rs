//! Key-value storage shared by the cache layer and circuit breaker persistence.
//!
//! The trait models the small surface a Redis-style store offers: get, set with TTL, delete,
//! prefix scan, and batched reads/writes. Values are opaque serialized payloads.

use crate::error::CacheError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Abstract key-value backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Fetch a value; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value, replacing any previous one. `None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove a key. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// List live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Batched get; the result is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Batched set sharing one TTL.
    async fn mset(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process key-value store. Expiry is checked on read and expired keys are swept on every write.
///
/// Clones share the same map. `set_unavailable(true)` makes every call fail, which lets tests
/// exercise a cache outage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<Mutex<HashMap<String, StoredValue>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|v| !v.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed. Every `set` also does this.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, v| !v.is_expired(now));
        before - guard.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut guard = self.lock();
        match guard.get(key) {
            Some(v) if v.is_expired(now) => {
                guard.remove(key);
                Ok(None)
            }
            Some(v) => Ok(Some(v.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut guard = self.lock();
        guard.retain(|_, v| !v.is_expired(now));
        guard.insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self.lock().remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
