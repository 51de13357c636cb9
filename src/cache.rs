//! TTL cache over a [`KeyValueStore`], used both to speed up reads and as the data source for
//! degraded responses.
//!
//! Keys are namespaced as `prefix:identifier` (optionally under a global namespace). Values are
//! stored as JSON. A value that no longer deserializes into the requested type is treated as a
//! miss and deleted, so one malformed entry cannot poison later reads.
//!
//! Backend failures on reads are also reported as misses: the cache is an optimization and a
//! fallback source, never a reason for a read to fail.

use crate::error::CacheError;
use crate::kv::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cache key composed of a key-class prefix and an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: String,
    id: String,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>, id: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), id: id.into() }
    }

    /// Key class, e.g. `stats`; also the lookup key for per-class TTLs.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.id)
    }
}

/// Typed, corruption-tolerant cache facade.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    store: Arc<dyn KeyValueStore>,
    namespace: Option<String>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, namespace: None }
    }

    /// Prefix every key with `namespace:` so several applications can share one store.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() { None } else { Some(namespace) };
        self
    }

    fn full_key(&self, key: &CacheKey) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        }
    }

    fn full_pattern(&self, pattern: &str) -> String {
        let prefix = pattern.trim_end_matches('*');
        match &self.namespace {
            Some(ns) => format!("{ns}:{prefix}"),
            None => prefix.to_string(),
        }
    }

    /// Read and decode a value. Absent, expired, corrupted, and unreachable all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let full = self.full_key(key);
        let raw = match self.store.get(&full).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(key = %full, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %full, error = %e, "cache read failed; treating as miss");
                return None;
            }
        };
        self.decode(&full, &raw).await
    }

    async fn decode<T: DeserializeOwned>(&self, full: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => {
                tracing::debug!(key = %full, "cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %full, error = %e, "corrupted cache entry; deleting");
                if let Err(del) = self.store.delete(full).await {
                    tracing::warn!(key = %full, error = %del, "failed to delete corrupted entry");
                }
                None
            }
        }
    }

    /// Encode and store a value for `ttl`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&self.full_key(key), raw, Some(ttl)).await
    }

    /// Return the cached value if present and well-formed; otherwise fetch, store, and return.
    ///
    /// Fetcher errors are returned untouched and nothing is cached. A failure to write the fresh
    /// value back is logged and does not affect the result.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        ttl: Duration,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = fetcher().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            tracing::warn!(key = %key, error = %e, "failed to populate cache");
        }
        Ok(value)
    }

    /// Remove one key.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.store.delete(&self.full_key(key)).await
    }

    /// Remove every key matching a glob prefix such as `leaderboard:*`. Returns how many went.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let keys = self.store.scan_prefix(&self.full_pattern(pattern)).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        tracing::debug!(pattern, removed, "invalidated cache pattern");
        Ok(removed)
    }

    /// Batched typed read, positionally aligned with `keys`.
    ///
    /// Corrupted entries are deleted and read as `None`; a backend failure reads as all misses.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[CacheKey]) -> Vec<Option<T>> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let raws = match self.store.mget(&full).await {
            Ok(raws) => raws,
            Err(e) => {
                tracing::warn!(keys = full.len(), error = %e, "cache batch read failed");
                return keys.iter().map(|_| None).collect();
            }
        };
        let mut out = Vec::with_capacity(raws.len());
        for (key, raw) in full.iter().zip(raws) {
            out.push(match raw {
                Some(raw) => self.decode(key, &raw).await,
                None => None,
            });
        }
        out
    }

    /// Batched typed write sharing one TTL.
    pub async fn mset<T: Serialize>(
        &self,
        entries: &[(CacheKey, T)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            encoded.push((self.full_key(key), serde_json::to_string(value)?));
        }
        self.store.mset(encoded, Some(ttl)).await
    }
}
