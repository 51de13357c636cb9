//! Configuration surface supplied by the embedding application.
//!
//! `ResilienceConfig` is plain serde data (durations in milliseconds) so it can be loaded from
//! JSON; every section converts into the corresponding validated runtime type. Sections left
//! out of the document take their defaults.
//!
//! ```json
//! {
//!   "breakers": { "default": { "failureThreshold": 5 }, "store": { "recoveryTimeoutMs": 30000 } },
//!   "retry": { "store": { "maxAttempts": 4 } },
//!   "pool": { "maxConnections": 20 },
//!   "cache": { "prefix": "game", "ttlMs": { "leaderboard": 10000 } }
//! }
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::retry::{RetryPolicy, RetryPolicyBuilder};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Name of the breaker entry whose settings apply to every unlisted dependency.
pub const DEFAULT_BREAKER: &str = "default";
/// Retry class for backing-store queries.
pub const STORE_CLASS: &str = "store";
/// Retry class for third-party APIs.
pub const EXTERNAL_API_CLASS: &str = "external-api";

/// Per-dependency breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
    pub state_ttl_ms: u64,
    pub reconcile_interval_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
            state_ttl_ms: 300_000,
            reconcile_interval_ms: 5_000,
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        Ok(CircuitBreakerConfig::new(
            self.failure_threshold,
            Duration::from_millis(self.recovery_timeout_ms),
            self.success_threshold,
        )?
        .with_state_ttl(Duration::from_millis(self.state_ttl_ms))?
        .with_reconcile_interval(Duration::from_millis(self.reconcile_interval_ms)))
    }
}

/// Settings for one retry operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::store()
    }
}

impl RetrySettings {
    pub fn store() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, max_delay_ms: 5_000, backoff_factor: 2.0, jitter: true }
    }

    pub fn external_api() -> Self {
        Self { max_attempts: 5, base_delay_ms: 500, max_delay_ms: 10_000, backoff_factor: 2.0, jitter: true }
    }

    /// Built-in settings for a known class name; unknown classes get the store settings.
    pub fn preset(class: &str) -> Self {
        match class {
            EXTERNAL_API_CLASS => Self::external_api(),
            _ => Self::store(),
        }
    }

    /// Builder named `class` preloaded with these settings.
    pub fn to_builder<E>(&self, class: &str) -> RetryPolicyBuilder<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RetryPolicy::builder()
            .name(class)
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff_factor(self.backoff_factor)
            .jitter_enabled(self.jitter)
    }

    pub fn to_policy<E>(&self, class: &str) -> Result<RetryPolicy<E>, ConfigError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.to_builder(class).build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSettings {
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    /// How often the idle sweep runs; `None` uses the idle timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval_ms: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_connections: 10, idle_timeout_ms: 30_000, acquire_timeout_ms: 5_000, reap_interval_ms: None }
    }
}

impl PoolSettings {
    pub fn to_config(&self) -> Result<PoolConfig, ConfigError> {
        PoolConfig::new(
            self.max_connections,
            Duration::from_millis(self.idle_timeout_ms),
            Duration::from_millis(self.acquire_timeout_ms),
        )
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.unwrap_or(self.idle_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    /// Namespace prepended to every cache key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub default_ttl_ms: u64,
    /// TTL per key class, overriding the built-in table (see [`CacheTtls::default`]) entry by entry.
    pub ttl_ms: HashMap<String, u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { prefix: None, default_ttl_ms: 300_000, ttl_ms: HashMap::new() }
    }
}

impl CacheSettings {
    pub fn to_ttls(&self) -> Result<CacheTtls, ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(ConfigError::MustBePositive { field: "cache.default_ttl_ms", provided: 0 });
        }
        let ttls = CacheTtls::default();
        ttls.set_default(Duration::from_millis(self.default_ttl_ms));
        for (class, &ms) in &self.ttl_ms {
            if ms == 0 {
                return Err(ConfigError::MustBePositive { field: "cache.ttl_ms", provided: 0 });
            }
            ttls.set(class, Duration::from_millis(ms));
        }
        Ok(ttls)
    }
}

/// Full configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Breaker settings by dependency name; the `default` entry covers unlisted dependencies.
    pub breakers: HashMap<String, BreakerSettings>,
    /// Retry settings by operation class.
    pub retry: HashMap<String, RetrySettings>,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
}

impl ResilienceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Convert every section, reporting the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker_registry()?;
        for class in self.retry.keys() {
            self.retry_policy::<crate::StoreError>(class)?;
        }
        self.pool.to_config()?;
        self.cache.to_ttls()?;
        Ok(())
    }

    /// Settings for `dependency`, falling back to the `default` entry.
    pub fn breaker_settings(&self, dependency: &str) -> BreakerSettings {
        self.breakers
            .get(dependency)
            .or_else(|| self.breakers.get(DEFAULT_BREAKER))
            .cloned()
            .unwrap_or_default()
    }

    /// Registry whose default and per-dependency overrides come from `breakers`.
    pub fn breaker_registry(&self) -> Result<CircuitBreakerRegistry, ConfigError> {
        let mut registry =
            CircuitBreakerRegistry::new(self.breaker_settings(DEFAULT_BREAKER).to_config()?);
        for (name, settings) in &self.breakers {
            if name != DEFAULT_BREAKER {
                registry = registry.with_override(name.clone(), settings.to_config()?);
            }
        }
        Ok(registry)
    }

    /// Builder for `class`; classes missing from the document start from their built-in preset.
    pub fn retry_builder<E>(&self, class: &str) -> RetryPolicyBuilder<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.retry.get(class) {
            Some(settings) => settings.to_builder(class),
            None => RetrySettings::preset(class).to_builder(class),
        }
    }

    pub fn retry_policy<E>(&self, class: &str) -> Result<RetryPolicy<E>, ConfigError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.retry_builder(class).build()
    }
}

/// Cache key classes used by the operations layer.
pub mod key_class {
    pub const STATS: &str = "stats";
    pub const LEADERBOARD: &str = "leaderboard";
    pub const MATCHES: &str = "matches";
}

#[derive(Debug, Clone, PartialEq)]
struct TtlTable {
    default: Duration,
    classes: HashMap<String, Duration>,
}

/// TTL per cache key class, updatable while the system runs.
///
/// Reads are lock-free (`ArcSwap`); clones share the same table.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    table: Arc<ArcSwap<TtlTable>>,
}

impl Default for CacheTtls {
    /// Stats 60s, leaderboard 30s, match history 1h, anything else 5m.
    fn default() -> Self {
        let ttls = Self::new(Duration::from_secs(300));
        ttls.set(key_class::STATS, Duration::from_secs(60));
        ttls.set(key_class::LEADERBOARD, Duration::from_secs(30));
        ttls.set(key_class::MATCHES, Duration::from_secs(3600));
        ttls
    }
}

impl CacheTtls {
    /// Empty table where every class uses `default`.
    pub fn new(default: Duration) -> Self {
        Self { table: Arc::new(ArcSwap::from_pointee(TtlTable { default, classes: HashMap::new() })) }
    }

    pub fn ttl_for(&self, class: &str) -> Duration {
        let table = self.table.load();
        table.classes.get(class).copied().unwrap_or(table.default)
    }

    pub fn default_ttl(&self) -> Duration {
        self.table.load().default
    }

    pub fn set(&self, class: &str, ttl: Duration) {
        self.table.rcu(|table| {
            let mut next = TtlTable::clone(table);
            next.classes.insert(class.to_string(), ttl);
            next
        });
    }

    pub fn set_default(&self, ttl: Duration) {
        self.table.rcu(|table| TtlTable { default: ttl, classes: table.classes.clone() });
    }
}
