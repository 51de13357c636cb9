//! Bounded pool of reusable backing-store connections.
//!
//! Capacity is a `tokio::sync::Semaphore` with `max_connections` permits. Every checked-out
//! connection holds one permit, so waiting callers are queued fairly and woken as soon as a
//! connection is released instead of polling. New connections are opened only when no idle one is
//! available, which keeps the number of open connections at or below `max_connections`.
//!
//! Idle connections are kept in most-recently-used order; [`ConnectionPool::evict_idle`] closes
//! those unused for longer than `idle_timeout`, and [`ConnectionPool::spawn_idle_reaper`] runs
//! that sweep periodically.

use crate::error::ConfigError;
use crate::ResilienceError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Produces and tears down connections to the backing store.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Close a connection the pool no longer needs. Defaults to dropping it.
    async fn close(&self, _conn: Self::Connection) {}
}

/// Validated pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    max_connections: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new(
        max_connections: usize,
        idle_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_connections == 0 {
            return Err(ConfigError::MustBePositive { field: "max_connections", provided: 0 });
        }
        if max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::AboveCeiling {
                field: "max_connections",
                provided: max_connections as u64,
                ceiling: Semaphore::MAX_PERMITS as u64,
            });
        }
        if idle_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "idle_timeout", provided: 0 });
        }
        if acquire_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "acquire_timeout", provided: 0 });
        }
        Ok(Self { max_connections, idle_timeout, acquire_timeout })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out.
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_connections: usize,
}

struct IdleConnection<C> {
    conn: C,
    last_used_at: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    total: usize,
}

struct PoolShared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<F::Connection>>,
}

impl<F: ConnectionFactory> PoolShared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn return_idle(&self, conn: F::Connection) {
        let mut state = self.lock();
        state.idle.push_back(IdleConnection { conn, last_used_at: Instant::now() });
    }

    fn forget_one(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
    }
}

/// Slot reserved for a connection that is still being opened. Released unless disarmed, so a
/// failed or cancelled `connect` never leaks capacity.
struct Reservation<'a, F: ConnectionFactory> {
    shared: &'a PoolShared<F>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> Reservation<'a, F> {
    fn new(shared: &'a PoolShared<F>) -> Self {
        shared.lock().total += 1;
        Self { shared, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget_one();
        }
    }
}

/// Bounded connection pool. Clones share the same connections.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Self {
            shared: Arc::new(PoolShared {
                factory,
                config,
                permits,
                state: Mutex::new(PoolState { idle: VecDeque::new(), total: 0 }),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Check out a connection, waiting up to `acquire_timeout` for one to free up.
    ///
    /// # Errors
    /// `ResilienceError::PoolExhausted` when the timeout elapses, or `Inner` when opening a new
    /// connection fails.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, ResilienceError<F::Error>> {
        let started = Instant::now();
        let config = &self.shared.config;
        let permit =
            match tokio::time::timeout(config.acquire_timeout, self.shared.permits.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    let waited = started.elapsed();
                    tracing::warn!(
                        waited_ms = waited.as_millis() as u64,
                        max_connections = config.max_connections,
                        "connection pool exhausted"
                    );
                    return Err(ResilienceError::PoolExhausted {
                        waited,
                        max_connections: config.max_connections,
                    });
                }
            };

        let (reused, expired) = self.take_idle();
        for conn in expired {
            self.shared.factory.close(conn).await;
        }
        if let Some(conn) = reused {
            tracing::debug!(wait_ms = started.elapsed().as_millis() as u64, "reusing idle connection");
            return Ok(PooledConnection::new(conn, self.shared.clone(), permit));
        }

        let reservation = Reservation::new(&self.shared);
        let conn = self.shared.factory.connect().await.map_err(ResilienceError::Inner)?;
        reservation.commit();
        tracing::debug!(total = self.shared.lock().total, "opened new connection");
        Ok(PooledConnection::new(conn, self.shared.clone(), permit))
    }

    /// Most recently used idle connection that has not outlived `idle_timeout`, plus every stale
    /// one passed over on the way. Stale connections are no longer counted in `total`.
    fn take_idle(&self) -> (Option<F::Connection>, Vec<F::Connection>) {
        let now = Instant::now();
        let timeout = self.shared.config.idle_timeout;
        let mut state = self.shared.lock();
        let mut expired = Vec::new();
        while let Some(idle) = state.idle.pop_back() {
            if now.saturating_duration_since(idle.last_used_at) < timeout {
                state.total = state.total.saturating_sub(expired.len());
                return (Some(idle.conn), expired);
            }
            expired.push(idle.conn);
        }
        state.total = state.total.saturating_sub(expired.len());
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "dropping stale idle connections on checkout");
        }
        (None, expired)
    }

    /// Return a connection to the pool. Dropping the guard does the same.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Run `op` with a checked-out connection; the connection is returned on every exit path.
    ///
    /// ```ignore
    /// let stats = pool
    ///     .with_connection(|conn| Box::pin(async move { conn.fetch_stats("alice").await }))
    ///     .await?;
    /// ```
    pub async fn with_connection<T, E, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        E: From<F::Error>,
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut conn = self.acquire().await.map_err(|e| e.map_inner(E::from))?;
        let result = op(&mut *conn).await;
        drop(conn);
        result.map_err(ResilienceError::Inner)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            max_connections: self.shared.config.max_connections,
        }
    }

    /// Close idle connections unused for at least `idle_timeout`. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<F::Connection> = {
            let mut state = self.shared.lock();
            let now = Instant::now();
            let timeout = self.shared.config.idle_timeout;
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|idle| now.saturating_duration_since(idle.last_used_at) >= timeout);
            state.idle = fresh;
            state.total = state.total.saturating_sub(stale.len());
            stale.into_iter().map(|idle| idle.conn).collect()
        };

        let evicted = expired.len();
        for conn in expired {
            self.shared.factory.close(conn).await;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "closed idle connections");
        }
        evicted
    }

    /// Run [`Self::evict_idle`] every `interval` on a background task.
    ///
    /// The task holds only a weak reference and exits once every pool handle is dropped.
    pub fn spawn_idle_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    tracing::debug!("connection pool dropped; idle reaper stopping");
                    break;
                };
                ConnectionPool { shared }.evict_idle().await;
            }
        })
    }
}

/// A checked-out connection. Returns to the pool when dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    shared: Arc<PoolShared<F>>,
    // Declared last so the connection is back in the idle list before the permit frees a waiter.
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(conn: F::Connection, shared: Arc<PoolShared<F>>, permit: OwnedSemaphorePermit) -> Self {
        Self { conn: Some(conn), shared, _permit: permit }
    }

    /// Close this connection instead of returning it, e.g. after it broke mid-query.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.forget_one();
            self.shared.factory.close(conn).await;
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken by `discard` and `drop`, both of which consume the guard.
        self.conn.as_ref().expect("pooled connection present until released")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection present until released")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.return_idle(conn);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("checked_out", &self.conn.is_some()).finish()
    }
}
