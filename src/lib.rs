#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # resilient-store
//!
//! A resilience layer between request handlers and a rate-limited backing store with a
//! key-value cache beside it. Operations keep answering, with bounded latency, while the store
//! is slow, overloaded, or unreachable.
//!
//! ## Building blocks
//!
//! - **Retry** with capped exponential backoff and ±10% jitter, per operation class
//! - **Connection pool** bounding concurrent store connections, with idle eviction
//! - **Circuit breaker** whose state is persisted to the key-value store and reconciled across
//!   process instances
//! - **Cache layer** with TTLs, pattern invalidation, and corruption-tolerant reads
//! - **Resilient operations** composing all of the above; reads degrade to cached or default
//!   values and report where the answer came from
//!
//! ## Quick Start
//!
//! ```rust
//! use resilient_store::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let db = MemoryDatabase::new();
//! let kv = Arc::new(InMemoryKeyValueStore::new());
//! let ops = ResilientOperations::builder(db.clone(), kv).build().unwrap();
//!
//! assert!(ops.update_stats("alice", &StatsUpdate { wins: 1, ..Default::default() }).await);
//! let stats = ops.get_stats("alice").await;
//! assert_eq!(stats.source, Source::Primary);
//! assert_eq!(stats.value.wins, 1);
//! # });
//! ```

pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod kv;
pub mod memory;
pub mod model;
pub mod operations;
pub mod pool;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod store;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use cache::{CacheKey, CacheLayer};
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Served, Source,
};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, CircuitBreakerRegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{CacheTtls, ResilienceConfig};
pub use error::{CacheError, ConfigError, ResilienceError, StoreError};
pub use jitter::Jitter;
pub use kv::{InMemoryKeyValueStore, KeyValueStore};
pub use memory::{MemoryConnection, MemoryDatabase};
pub use model::{LeaderboardEntry, MatchRecord, PlayerStats, StatsUpdate};
pub use operations::{ResilientOperations, ResilientOperationsBuilder};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStatus, PooledConnection};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::GameStore;
