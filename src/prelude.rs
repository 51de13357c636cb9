//! Convenient re-exports for common resilient-store types.
pub use crate::{
    cache::{CacheKey, CacheLayer},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Served, Source},
    circuit_breaker_registry::CircuitBreakerRegistry,
    config::{CacheTtls, ResilienceConfig},
    error::{CacheError, ConfigError, ResilienceError, StoreError},
    kv::{InMemoryKeyValueStore, KeyValueStore},
    memory::MemoryDatabase,
    model::{LeaderboardEntry, MatchRecord, PlayerStats, StatsUpdate},
    operations::ResilientOperations,
    pool::{ConnectionFactory, ConnectionPool, PoolConfig},
    retry::RetryPolicy,
    store::GameStore,
};
