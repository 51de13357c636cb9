//! Operation-level API over the backing store.
//!
//! Every operation runs `breaker → retry → pool → query`:
//! - reads populate the cache on success and, when the store is skipped or fails, serve the
//!   cached value or a documented zero value. They never return an error.
//! - writes report `true` once the store accepted them and `false` when it was skipped or failed
//!   (not persisted). Cache entries they make stale are invalidated whenever the store was
//!   attempted; a write short-circuited by an open breaker leaves the cache alone.
//!
//! Results carry a [`Source`] so staleness-sensitive callers can tell degraded answers apart.
//!
//! Every attempt may wait out the full `acquire_timeout`, so the worst-case latency of a single
//! operation is `max_attempts × acquire_timeout` plus the jittered backoff between attempts; see
//! [`ResilientOperations::worst_case_latency`].

use crate::cache::{CacheKey, CacheLayer};
use crate::circuit_breaker::{CircuitState, Served, Source};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::{key_class, CacheTtls, ResilienceConfig, STORE_CLASS};
use crate::error::ConfigError;
use crate::kv::KeyValueStore;
use crate::model::{LeaderboardEntry, MatchRecord, PlayerStats, StatsUpdate};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStatus};
use crate::retry::RetryPolicy;
use crate::store::GameStore;
use crate::StoreError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Resilient read/write operations over a pooled backing store.
pub struct ResilientOperations<F>
where
    F: ConnectionFactory<Error = StoreError>,
    F::Connection: GameStore,
{
    dependency: String,
    pool: ConnectionPool<F>,
    retry: RetryPolicy<StoreError>,
    breakers: CircuitBreakerRegistry,
    cache: CacheLayer,
    ttls: CacheTtls,
    reap_interval: Duration,
}

impl<F> std::fmt::Debug for ResilientOperations<F>
where
    F: ConnectionFactory<Error = StoreError>,
    F::Connection: GameStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientOperations")
            .field("dependency", &self.dependency)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("breakers", &self.breakers)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<F> ResilientOperations<F>
where
    F: ConnectionFactory<Error = StoreError>,
    F::Connection: GameStore,
{
    /// Start wiring operations over `factory`, caching and persisting breaker state in `kv`.
    pub fn builder(factory: F, kv: Arc<dyn KeyValueStore>) -> ResilientOperationsBuilder<F> {
        ResilientOperationsBuilder {
            factory,
            kv,
            config: ResilienceConfig::default(),
            retry: None,
            clock: None,
            ttls: None,
        }
    }

    /// Stats for `player_id`; unknown players get zeroed stats.
    pub async fn get_stats(&self, player_id: &str) -> Served<PlayerStats> {
        let key = CacheKey::new(key_class::STATS, player_id);
        let player = player_id.to_string();
        self.read(
            &key,
            key_class::STATS,
            move |conn| {
                let player = player.clone();
                Box::pin(async move {
                    let stats = conn.fetch_stats(&player).await?;
                    Ok(stats.unwrap_or_else(|| PlayerStats::empty(player)))
                })
            },
            || PlayerStats::empty(player_id),
        )
        .await
    }

    /// Apply `update` to `player_id`. `false` means the update was not persisted.
    pub async fn update_stats(&self, player_id: &str, update: &StatsUpdate) -> bool {
        let stale = [StaleEntry::Key(CacheKey::new(key_class::STATS, player_id)), StaleEntry::leaderboard()];
        let player = player_id.to_string();
        let update = update.clone();
        self.write(
            "update_stats",
            player_id,
            move |conn| {
                let (player, update) = (player.clone(), update.clone());
                Box::pin(async move { conn.apply_stats_update(&player, &update).await.map(drop) })
            },
            &stale,
        )
        .await
    }

    /// Top `limit` players; an empty board when nothing can be served.
    pub async fn get_leaderboard(&self, limit: usize) -> Served<Vec<LeaderboardEntry>> {
        let key = CacheKey::new(key_class::LEADERBOARD, limit.to_string());
        self.read(
            &key,
            key_class::LEADERBOARD,
            move |conn| Box::pin(async move { conn.fetch_leaderboard(limit).await }),
            Vec::new,
        )
        .await
    }

    /// Record a finished match. `false` means the match was not persisted.
    pub async fn save_match(&self, record: &MatchRecord) -> bool {
        let player_id = record.player_id.as_str();
        let owned = record.clone();
        let stale = [
            StaleEntry::Key(CacheKey::new(key_class::STATS, player_id)),
            StaleEntry::leaderboard(),
            StaleEntry::Pattern(format!("{}:{player_id}:*", key_class::MATCHES)),
        ];
        self.write(
            "save_match",
            player_id,
            move |conn| {
                let record = owned.clone();
                Box::pin(async move { conn.insert_match(&record).await })
            },
            &stale,
        )
        .await
    }

    /// Newest `limit` matches for `player_id`; empty when nothing can be served.
    pub async fn get_match_history(&self, player_id: &str, limit: usize) -> Served<Vec<MatchRecord>> {
        let key = CacheKey::new(key_class::MATCHES, format!("{player_id}:{limit}"));
        let player = player_id.to_string();
        self.read(
            &key,
            key_class::MATCHES,
            move |conn| {
                let player = player.clone();
                Box::pin(async move { conn.fetch_matches(&player, limit).await })
            },
            Vec::new,
        )
        .await
    }

    /// Local view of every breaker created so far.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.snapshot()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Live TTL table; updates apply to subsequent cache writes.
    pub fn cache_ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Upper bound on time spent waiting for connections and backing off, for callers setting
    /// upstream deadlines: `max_attempts × acquire_timeout` plus the jittered backoff sum. Query
    /// execution time is not included.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = u32::try_from(self.retry.max_attempts()).unwrap_or(u32::MAX);
        self.pool
            .config()
            .acquire_timeout()
            .saturating_mul(attempts)
            .saturating_add(self.retry.worst_case_backoff())
    }

    /// Start the pool's periodic idle sweep. Must be called from within a tokio runtime.
    pub fn spawn_idle_reaper(&self) -> JoinHandle<()> {
        self.pool.spawn_idle_reaper(self.reap_interval)
    }

    async fn read<T, Q, D>(&self, key: &CacheKey, class: &str, query: Q, default: D) -> Served<T>
    where
        T: Serialize + DeserializeOwned + Send,
        Q: for<'c> Fn(&'c mut F::Connection) -> BoxFuture<'c, Result<T, StoreError>>,
        D: FnOnce() -> T,
    {
        // Query closures own their inputs: each attempt's future may only borrow the connection.
        let breaker = self.breakers.get_or_create(&self.dependency);
        let query = &query;
        let served = breaker
            .execute_or_else(
                move || self.retry.execute(move || self.pool.with_connection(move |conn| query(conn))),
                move || async move {
                    match self.cache.get::<T>(key).await {
                        Some(value) => {
                            tracing::warn!(key = %key, "serving cached value; store unavailable");
                            Served::cached(value)
                        }
                        None => {
                            tracing::warn!(key = %key, "serving default value; store unavailable and cache empty");
                            Served::default_value(default())
                        }
                    }
                },
            )
            .await;

        if served.source == Source::Primary {
            if let Err(e) = self.cache.set(key, &served.value, self.ttls.ttl_for(class)).await {
                tracing::warn!(key = %key, error = %e, "failed to populate cache");
            }
        }
        served
    }

    async fn write<Q>(&self, operation: &'static str, player_id: &str, query: Q, stale: &[StaleEntry]) -> bool
    where
        Q: for<'c> Fn(&'c mut F::Connection) -> BoxFuture<'c, Result<(), StoreError>>,
    {
        let breaker = self.breakers.get_or_create(&self.dependency);
        let query = &query;
        let attempted = AtomicBool::new(false);
        let attempted = &attempted;
        let served = breaker
            .execute_with_fallback(
                move || async move {
                    attempted.store(true, Ordering::Relaxed);
                    self.retry
                        .execute(move || self.pool.with_connection(move |conn| query(conn)))
                        .await
                        .map(|()| true)
                },
                move || async move {
                    tracing::error!(operation, player = %player_id, "write not persisted; store unavailable");
                    false
                },
            )
            .await;

        // A failed attempt may still have landed (e.g. a timeout after commit). A short-circuited
        // write never reached the store, and the cached entries are what degraded reads serve.
        if attempted.load(Ordering::Relaxed) {
            self.invalidate(stale).await;
        }
        served.value
    }

    async fn invalidate(&self, stale: &[StaleEntry]) {
        for entry in stale {
            let result = match entry {
                StaleEntry::Key(key) => self.cache.invalidate(key).await.map(usize::from),
                StaleEntry::Pattern(pattern) => self.cache.invalidate_pattern(pattern).await,
            };
            if let Err(e) = result {
                tracing::warn!(entry = ?entry, error = %e, "failed to invalidate cache entry");
            }
        }
    }
}

/// A cache entry, or family of entries, made stale by a write.
#[derive(Debug)]
enum StaleEntry {
    Key(CacheKey),
    Pattern(String),
}

impl StaleEntry {
    fn leaderboard() -> Self {
        StaleEntry::Pattern(format!("{}:*", key_class::LEADERBOARD))
    }
}

/// Builder for [`ResilientOperations`].
pub struct ResilientOperationsBuilder<F> {
    factory: F,
    kv: Arc<dyn KeyValueStore>,
    config: ResilienceConfig,
    retry: Option<RetryPolicy<StoreError>>,
    clock: Option<Arc<dyn Clock>>,
    ttls: Option<CacheTtls>,
}

impl<F> ResilientOperationsBuilder<F>
where
    F: ConnectionFactory<Error = StoreError>,
    F::Connection: GameStore,
{
    /// Breaker, retry, pool, and cache settings. Defaults apply when not called.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this policy for store queries instead of the configured `store` class.
    pub fn retry_policy(mut self, policy: RetryPolicy<StoreError>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Clock for breaker timing and persisted timestamps.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Share an existing TTL table instead of building one from the config.
    pub fn cache_ttls(mut self, ttls: CacheTtls) -> Self {
        self.ttls = Some(ttls);
        self
    }

    pub fn build(self) -> Result<ResilientOperations<F>, ConfigError> {
        let config = self.config;
        let pool = ConnectionPool::new(self.factory, config.pool.to_config()?);

        let mut breakers = config.breaker_registry()?.with_store(self.kv.clone());
        if let Some(clock) = self.clock {
            breakers = breakers.with_shared_clock(clock);
        }

        let retry = match self.retry {
            Some(policy) => policy,
            None => config
                .retry_builder::<StoreError>(STORE_CLASS)
                .should_retry(StoreError::is_transient)
                .build()?,
        };

        let ttls = match self.ttls {
            Some(ttls) => ttls,
            None => config.cache.to_ttls()?,
        };

        let mut cache = CacheLayer::new(self.kv);
        if let Some(prefix) = &config.cache.prefix {
            cache = cache.with_namespace(prefix.clone());
        }

        Ok(ResilientOperations {
            dependency: STORE_CLASS.to_string(),
            pool,
            retry,
            breakers,
            cache,
            ttls,
            reap_interval: config.pool.reap_interval(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::InMemoryKeyValueStore;
    use crate::memory::MemoryDatabase;
    use crate::InstantSleeper;

    struct Harness {
        ops: ResilientOperations<MemoryDatabase>,
        db: MemoryDatabase,
        kv: InMemoryKeyValueStore,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let db = MemoryDatabase::new();
        let kv = InMemoryKeyValueStore::new();
        let clock = ManualClock::starting_at(1_000_000);
        let config = ResilienceConfig::from_json_str(
            r#"{ "breakers": { "store": { "failureThreshold": 2, "recoveryTimeoutMs": 10000, "successThreshold": 1, "reconcileIntervalMs": 0 } } }"#,
        )
        .unwrap();
        let retry = RetryPolicy::for_store()
            .should_retry(StoreError::is_transient)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let ops = ResilientOperations::builder(db.clone(), Arc::new(kv.clone()))
            .config(config)
            .retry_policy(retry)
            .clock(clock.clone())
            .build()
            .unwrap();
        Harness { ops, db, kv, clock }
    }

    fn stats(player: &str, score: u64) -> PlayerStats {
        PlayerStats { player_id: player.into(), total_score: score, games_played: 1, ..Default::default() }
    }

    #[tokio::test]
    async fn primary_read_populates_cache() {
        let h = harness();
        h.db.seed_stats(stats("alice", 10));

        let served = h.ops.get_stats("alice").await;
        assert_eq!(served, Served::primary(stats("alice", 10)));
        assert!(h.kv.get("stats:alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_falls_back_to_cache_then_default() {
        let h = harness();
        h.db.seed_stats(stats("alice", 10));
        h.ops.get_stats("alice").await;

        h.db.set_down(true);
        let served = h.ops.get_stats("alice").await;
        assert_eq!(served, Served::cached(stats("alice", 10)));

        let unknown = h.ops.get_stats("bob").await;
        assert_eq!(unknown, Served::default_value(PlayerStats::empty("bob")));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_before_degrading() {
        let h = harness();
        h.db.seed_stats(stats("alice", 10));
        h.db.fail_next(2, StoreError::Transient("timeout".into()));

        let served = h.ops.get_stats("alice").await;
        assert_eq!(served.source, Source::Primary);
        assert_eq!(h.db.query_count(), 3);
    }

    #[tokio::test]
    async fn rejected_query_is_not_retried_but_counts_against_breaker() {
        let h = harness();
        let served = h.ops.get_stats("").await;
        assert_eq!(served.source, Source::Default);
        assert_eq!(h.db.query_count(), 1);
        assert_eq!(h.ops.breakers().get_or_create("store").snapshot().failures, 1);
    }

    #[tokio::test]
    async fn open_breaker_skips_the_store() {
        let h = harness();
        h.db.set_down(true);
        h.ops.get_leaderboard(10).await;
        h.ops.get_leaderboard(10).await;
        assert_eq!(h.ops.breaker_states(), vec![("store".to_string(), CircuitState::Open)]);

        h.db.set_down(false);
        let connects = h.db.connect_count();
        let served = h.ops.get_leaderboard(10).await;
        assert_eq!(served.source, Source::Default);
        assert_eq!(h.db.connect_count(), connects, "no connection attempted while open");

        h.clock.advance(10_000);
        assert_eq!(h.ops.get_leaderboard(10).await.source, Source::Primary);
        assert_eq!(h.ops.breaker_states(), vec![("store".to_string(), CircuitState::Closed)]);
    }

    #[tokio::test]
    async fn writes_invalidate_stale_entries() {
        let h = harness();
        h.db.seed_stats(stats("alice", 10));
        h.ops.get_stats("alice").await;
        h.ops.get_leaderboard(5).await;
        h.ops.get_leaderboard(10).await;

        let update = StatsUpdate { score: 5, ..Default::default() };
        assert!(h.ops.update_stats("alice", &update).await);
        assert!(h.kv.get("stats:alice").await.unwrap().is_none());
        assert!(h.kv.scan_prefix("leaderboard:").await.unwrap().is_empty());
        assert_eq!(h.ops.get_stats("alice").await.value.total_score, 15);
    }

    #[tokio::test]
    async fn failed_write_returns_false() {
        let h = harness();
        h.db.set_down(true);
        let update = StatsUpdate { wins: 1, ..Default::default() };
        assert!(!h.ops.update_stats("alice", &update).await);
        assert_eq!(h.db.peek_stats("alice"), None);
    }

    #[tokio::test]
    async fn save_match_invalidates_history_for_that_player_only() {
        let h = harness();
        h.ops.get_match_history("alice", 10).await;
        h.ops.get_match_history("bob", 10).await;

        let record = MatchRecord {
            match_id: "m1".into(),
            player_id: "alice".into(),
            opponent_id: Some("bob".into()),
            score: 30,
            won: true,
            played_at: 5,
        };
        assert!(h.ops.save_match(&record).await);
        assert!(h.kv.get("matches:alice:10").await.unwrap().is_none());
        assert!(h.kv.get("matches:bob:10").await.unwrap().is_some());

        let history = h.ops.get_match_history("alice", 10).await;
        assert_eq!(history, Served::primary(vec![record]));
    }

    #[tokio::test]
    async fn worst_case_latency_counts_every_acquire_and_jittered_backoff() {
        let h = harness();
        // 3 × 5s acquire, then 1s and 2s of backoff each stretched by up to 10%
        let bound = h.ops.worst_case_latency();
        assert_eq!(bound, Duration::from_secs(15) + h.ops.retry.worst_case_backoff());
        assert!(bound >= Duration::from_millis(18_299) && bound <= Duration::from_millis(18_301));
    }

    #[tokio::test]
    async fn ttl_table_updates_apply_to_later_writes() {
        let h = harness();
        assert_eq!(h.ops.cache_ttls().ttl_for(key_class::STATS), Duration::from_secs(60));
        h.ops.cache_ttls().set(key_class::STATS, Duration::from_secs(1));
        assert_eq!(h.ops.cache_ttls().ttl_for(key_class::STATS), Duration::from_secs(1));
    }

    #[test]
    fn invalid_config_fails_build() {
        let config = ResilienceConfig::from_json_str(r#"{ "pool": { "maxConnections": 0 } }"#).unwrap();
        let result = ResilientOperations::builder(MemoryDatabase::new(), Arc::new(InMemoryKeyValueStore::new()))
            .config(config)
            .build();
        assert!(matches!(result, Err(ConfigError::MustBePositive { field: "max_connections", .. })));
    }
}
