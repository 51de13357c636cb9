//! Registry of named circuit breakers.
//!
//! Breakers are created lazily, one per dependency name, and share the registry's store and
//! clock so every breaker in a process persists to the same backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::kv::KeyValueStore;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker was never created.
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
}

/// Lazily populated map of dependency name to breaker.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: Arc<HashMap<String, CircuitBreakerConfig>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field("breakers", &self.snapshot())
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: Arc::new(HashMap::new()),
            store: None,
            clock: Arc::new(SystemClock),
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist every breaker created from now on through `store`.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Per-dependency configuration that replaces the default for `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Arc::make_mut(&mut self.overrides).insert(name.into(), config);
        self
    }

    /// Config a breaker named `name` is (or would be) created with.
    pub fn config_for(&self, name: &str) -> &CircuitBreakerConfig {
        self.overrides.get(name).unwrap_or(&self.default_config)
    }

    /// Fetch the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(dependency = %name, "creating circuit breaker");
                let breaker = CircuitBreaker::new(name, self.config_for(name).clone())
                    .with_shared_clock(self.clock.clone());
                match &self.store {
                    Some(store) => breaker.with_store(store.clone()),
                    None => breaker,
                }
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    /// Force the named breaker closed and persist the reset.
    pub async fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        let breaker = self
            .get(name)
            .ok_or_else(|| CircuitBreakerRegistryError::NotFound { name: name.to_string() })?;
        breaker.reset().await;
        Ok(())
    }

    /// Breaker states sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
