//! Circuit breaker with externally persisted state.
//!
//! Each breaker guards one named dependency and moves through
//! `Closed → Open → HalfOpen → Closed | Open`:
//! - **Closed**: every call runs the primary. A failure increments `failures`, a success
//!   decrements it (floored at 0), so isolated failures heal. Reaching `failure_threshold` opens
//!   the circuit and records the failure time.
//! - **Open**: calls skip the primary. Once `recovery_timeout` has passed since the last failure,
//!   the next call moves the breaker to HalfOpen and is evaluated there.
//! - **HalfOpen**: the primary runs. `success_threshold` successes close the circuit; any single
//!   failure reopens it immediately.
//!
//! Every transition and counter change is written to a [`KeyValueStore`] under
//! `circuit_breaker:{name}` with a TTL. The local copy is authoritative for this process; it is
//! hydrated on first use and reconciled with the shared record at most once per
//! `reconcile_interval`, adopting the shared record when it is newer. This is eventually
//! consistent across processes, not linearizable: two instances may briefly disagree.

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::kv::KeyValueStore;
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Key prefix for persisted breaker records.
pub const STATE_KEY_PREFIX: &str = "circuit_breaker:";

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    #[default]
    Closed,
    /// Short-circuits calls until the recovery timeout elapses.
    Open,
    /// Probe mode: calls run to test whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Where a guarded call's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Freshly produced by the primary operation.
    Primary,
    /// Produced by a caller-supplied fallback.
    Fallback,
    /// Served from the cache because the primary was skipped or failed.
    Cache,
    /// A documented zero value, because neither the primary nor the cache had data.
    Default,
}

/// A value together with the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub source: Source,
}

impl<T> Served<T> {
    pub fn primary(value: T) -> Self {
        Self { value, source: Source::Primary }
    }

    pub fn fallback(value: T) -> Self {
        Self { value, source: Source::Fallback }
    }

    pub fn cached(value: T) -> Self {
        Self { value, source: Source::Cache }
    }

    pub fn default_value(value: T) -> Self {
        Self { value, source: Source::Default }
    }

    /// True unless the value came from the primary.
    pub fn is_degraded(&self) -> bool {
        self.source != Source::Primary
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Served<U> {
        Served { value: f(self.value), source: self.source }
    }
}

/// Validated configuration for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    state_ttl: Duration,
    reconcile_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            state_ttl: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation; persistence settings take their defaults.
    pub fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::MustBePositive { field: "failure_threshold", provided: 0 });
        }
        if recovery_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "recovery_timeout", provided: 0 });
        }
        if success_threshold == 0 {
            return Err(ConfigError::MustBePositive { field: "success_threshold", provided: 0 });
        }
        Ok(Self { failure_threshold, recovery_timeout, success_threshold, ..Self::default() })
    }

    /// TTL of the persisted record; an idle breaker resets to Closed once it lapses.
    pub fn with_state_ttl(mut self, ttl: Duration) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::MustBePositive { field: "state_ttl", provided: 0 });
        }
        self.state_ttl = ttl;
        Ok(self)
    }

    /// Minimum spacing between reads of the shared record. Zero re-reads on every call.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
    }
}

/// Breaker state as persisted in the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    /// Wall-clock millis of the most recent recorded failure.
    pub last_failure_time: u64,
    /// Consecutive HalfOpen successes; zero in every other state.
    pub success_count: u32,
    /// Wall-clock millis of the last change, used to pick the newer copy when reconciling.
    pub updated_at: u64,
}

#[derive(Debug, Default)]
struct BreakerCore {
    snapshot: BreakerSnapshot,
    last_reconciled: Option<u64>,
}

enum Admission {
    Proceed(CircuitState),
    Reject(CircuitState),
}

/// Circuit breaker guarding a named dependency.
///
/// Clones share the same underlying state, so all handles observe and affect the same circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
    core: Arc<Mutex<BreakerCore>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("persisted", &self.store.is_some())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create an in-memory breaker for `name`. Attach a store with [`Self::with_store`].
    ///
    /// # Examples
    /// ```
    /// use resilient_store::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, Duration::from_secs(30), 2).unwrap();
    /// let breaker = CircuitBreaker::new("store", config);
    /// assert_eq!(breaker.state(), CircuitState::Closed);
    /// ```
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config,
            clock: Arc::new(SystemClock),
            store: None,
            core: Arc::new(Mutex::new(BreakerCore::default())),
        }
    }

    /// Persist and reconcile state through `store`.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Local view of the current state.
    pub fn state(&self) -> CircuitState {
        self.lock().snapshot.state
    }

    /// Local view of all counters.
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.lock().snapshot.clone()
    }

    /// Key under which this breaker's record is persisted.
    pub fn state_key(&self) -> String {
        format!("{STATE_KEY_PREFIX}{}", self.name)
    }

    /// Force the breaker Closed with zeroed counters and persist the result.
    pub async fn reset(&self) {
        let snapshot = {
            let mut core = self.lock();
            core.snapshot = BreakerSnapshot { updated_at: self.now_millis(), ..Default::default() };
            core.snapshot.clone()
        };
        tracing::info!(dependency = %self.name, "Circuit breaker reset → closed");
        self.persist(snapshot).await;
    }

    /// Run `primary` under breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::DependencyUnavailable` while the circuit is open, and when a
    /// half-open probe fails. Failures while closed are returned as produced by `primary`.
    pub async fn execute<T, E, Fut, Op>(&self, primary: Op) -> Result<T, ResilienceError<E>>
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let admitted = match self.admit().await {
            Admission::Proceed(state) => state,
            Admission::Reject(state) => {
                return Err(ResilienceError::DependencyUnavailable {
                    dependency: self.name.to_string(),
                    state,
                })
            }
        };

        match primary().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err).await;
                if admitted == CircuitState::HalfOpen {
                    Err(ResilienceError::DependencyUnavailable {
                        dependency: self.name.to_string(),
                        state: self.state(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Run `primary`, recovering with `fallback` when the circuit is open or the primary fails.
    ///
    /// The fallback is a local recovery: its value is returned as a success, tagged
    /// [`Source::Fallback`].
    pub async fn execute_with_fallback<T, E, Fut, Op, FbFut, Fb>(
        &self,
        primary: Op,
        fallback: Fb,
    ) -> Served<T>
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        FbFut: Future<Output = T>,
        Fb: FnOnce() -> FbFut,
    {
        self.execute_or_else(primary, || async move { Served::fallback(fallback().await) }).await
    }

    /// Like [`Self::execute_with_fallback`], but the fallback reports its own [`Source`].
    pub async fn execute_or_else<T, E, Fut, Op, FbFut, Fb>(
        &self,
        primary: Op,
        fallback: Fb,
    ) -> Served<T>
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        FbFut: Future<Output = Served<T>>,
        Fb: FnOnce() -> FbFut,
    {
        if let Admission::Reject(state) = self.admit().await {
            tracing::debug!(dependency = %self.name, %state, "short-circuited to fallback");
            return fallback().await;
        }

        match primary().await {
            Ok(value) => {
                self.record_success().await;
                Served::primary(value)
            }
            Err(err) => {
                self.record_failure(&err).await;
                fallback().await
            }
        }
    }

    async fn admit(&self) -> Admission {
        self.reconcile().await;

        let (admission, changed) = {
            let mut core = self.lock();
            let now = self.now_millis();
            let snap = &mut core.snapshot;
            match snap.state {
                CircuitState::Closed => (Admission::Proceed(CircuitState::Closed), None),
                CircuitState::HalfOpen => (Admission::Proceed(CircuitState::HalfOpen), None),
                CircuitState::Open => {
                    let elapsed = now.saturating_sub(snap.last_failure_time);
                    if u128::from(elapsed) >= self.config.recovery_timeout.as_millis() {
                        snap.state = CircuitState::HalfOpen;
                        snap.success_count = 0;
                        snap.updated_at = now;
                        tracing::info!(dependency = %self.name, elapsed_ms = elapsed, "Circuit breaker → half-open");
                        (Admission::Proceed(CircuitState::HalfOpen), Some(snap.clone()))
                    } else {
                        (Admission::Reject(CircuitState::Open), None)
                    }
                }
            }
        };

        if let Some(snapshot) = changed {
            self.persist(snapshot).await;
        }
        admission
    }

    async fn record_success(&self) {
        let changed = {
            let mut core = self.lock();
            let now = self.now_millis();
            let snap = &mut core.snapshot;
            match snap.state {
                CircuitState::Closed if snap.failures > 0 => {
                    snap.failures -= 1;
                    snap.updated_at = now;
                    Some(snap.clone())
                }
                CircuitState::HalfOpen => {
                    snap.success_count += 1;
                    if snap.success_count >= self.config.success_threshold {
                        snap.state = CircuitState::Closed;
                        snap.failures = 0;
                        snap.success_count = 0;
                        tracing::info!(dependency = %self.name, "Circuit breaker → closed");
                    } else {
                        tracing::debug!(
                            dependency = %self.name,
                            successes = snap.success_count,
                            needed = self.config.success_threshold,
                            "Circuit breaker: half-open probe succeeded"
                        );
                    }
                    snap.updated_at = now;
                    Some(snap.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = changed {
            self.persist(snapshot).await;
        }
    }

    async fn record_failure<E: fmt::Display>(&self, err: &E) {
        let snapshot = {
            let mut core = self.lock();
            let now = self.now_millis();
            let snap = &mut core.snapshot;
            snap.failures = snap.failures.saturating_add(1);
            match snap.state {
                CircuitState::Closed => {
                    snap.last_failure_time = now;
                    if snap.failures >= self.config.failure_threshold {
                        snap.state = CircuitState::Open;
                        tracing::error!(
                            dependency = %self.name,
                            failures = snap.failures,
                            threshold = self.config.failure_threshold,
                            error = %err,
                            "Circuit breaker → open"
                        );
                    } else {
                        tracing::debug!(dependency = %self.name, failures = snap.failures, error = %err, "guarded call failed");
                    }
                }
                CircuitState::HalfOpen => {
                    snap.state = CircuitState::Open;
                    snap.last_failure_time = now;
                    snap.success_count = 0;
                    tracing::warn!(
                        dependency = %self.name,
                        failures = snap.failures,
                        error = %err,
                        "Circuit breaker: probe failed → open"
                    );
                }
                // A call admitted before another caller reopened the circuit.
                CircuitState::Open => {}
            }
            snap.updated_at = now;
            snap.clone()
        };
        self.persist(snapshot).await;
    }

    /// Hydrate from, or reconcile with, the shared record when the interval has elapsed.
    async fn reconcile(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let now = self.now_millis();
        {
            let mut core = self.lock();
            let interval = self.config.reconcile_interval.as_millis();
            if let Some(last) = core.last_reconciled {
                if u128::from(now.saturating_sub(last)) < interval && interval > 0 {
                    return;
                }
            }
            core.last_reconciled = Some(now);
        }

        let key = self.state_key();
        let remote = match store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<BreakerSnapshot>(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!(dependency = %self.name, error = %e, "discarding malformed breaker record");
                    if let Err(del) = store.delete(&key).await {
                        tracing::warn!(dependency = %self.name, error = %del, "failed to delete malformed breaker record");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(dependency = %self.name, error = %e, "failed to read breaker state; keeping local view");
                return;
            }
        };

        let mut core = self.lock();
        let local = &mut core.snapshot;
        match remote {
            Some(remote) if remote.updated_at > local.updated_at => {
                if remote.state != local.state {
                    tracing::info!(
                        dependency = %self.name,
                        from = %local.state,
                        to = %remote.state,
                        "Circuit breaker: adopted shared state"
                    );
                }
                *local = remote;
            }
            Some(_) => {}
            None => {
                let idle = now.saturating_sub(local.updated_at);
                let dirty = local.state != CircuitState::Closed || local.failures > 0;
                if dirty && u128::from(idle) >= self.config.state_ttl.as_millis() {
                    tracing::info!(dependency = %self.name, idle_ms = idle, "Circuit breaker: shared record expired → closed");
                    *local = BreakerSnapshot { updated_at: now, ..Default::default() };
                }
            }
        }
    }

    async fn persist(&self, snapshot: BreakerSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(dependency = %self.name, error = %e, "failed to encode breaker state");
                return;
            }
        };
        if let Err(e) = store.set(&self.state_key(), raw, Some(self.config.state_ttl)).await {
            tracing::warn!(dependency = %self.name, error = %e, "failed to persist breaker state");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::InMemoryKeyValueStore;
    use crate::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(failures: u32, recovery_ms: u64, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(failures, Duration::from_millis(recovery_ms), successes)
            .expect("valid config")
            .with_reconcile_interval(Duration::ZERO)
    }

    fn breaker(failures: u32, recovery_ms: u64, successes: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000);
        let breaker =
            CircuitBreaker::new("store", config(failures, recovery_ms, successes)).with_clock(clock.clone());
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<StoreError>> {
        breaker
            .execute(|| async { Err(ResilienceError::Inner(StoreError::Transient("down".into()))) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, ResilienceError<StoreError>> {
        breaker.execute(|| async { Ok::<_, ResilienceError<StoreError>>(7) }).await
    }

    #[test]
    fn rejects_zero_thresholds_and_timeout() {
        assert!(matches!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1), 1),
            Err(ConfigError::MustBePositive { field: "failure_threshold", .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, Duration::ZERO, 1),
            Err(ConfigError::MustBePositive { field: "recovery_timeout", .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, Duration::from_secs(1), 0),
            Err(ConfigError::MustBePositive { field: "success_threshold", .. })
        ));
    }

    #[tokio::test]
    async fn starts_closed_and_runs_primary() {
        let (breaker, _) = breaker(3, 1000, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn closed_failures_propagate_raw_error() {
        let (breaker, _) = breaker(3, 1000, 1);
        let err = fail(&breaker).await.unwrap_err();
        assert_eq!(err.into_inner(), Some(StoreError::Transient("down".into())));
        assert_eq!(breaker.snapshot().failures, 1);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_skips_primary() {
        let (breaker, clock) = breaker(3, 10_000, 1);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = breaker
            .execute(|| async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<StoreError>>(1)
            })
            .await;
        assert!(result.unwrap_err().is_dependency_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "primary must not run while open");

        let served = breaker
            .execute_with_fallback(|| async { Ok::<_, ResilienceError<StoreError>>(0) }, || async { 42 })
            .await;
        assert_eq!(served, Served::fallback(42));
    }

    #[tokio::test]
    async fn success_in_closed_heals_one_failure() {
        let (breaker, _) = breaker(3, 1000, 1);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.snapshot().failures, 1);

        // F F S F keeps the breaker closed; one more failure trips it.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failures_never_go_negative() {
        let (breaker, _) = breaker(2, 1000, 1);
        for _ in 0..5 {
            let _ = succeed(&breaker).await;
        }
        assert_eq!(breaker.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn recovery_timeout_moves_to_half_open() {
        let (breaker, clock) = breaker(1, 100, 2);
        let _ = fail(&breaker).await;
        clock.advance(99);
        assert!(succeed(&breaker).await.unwrap_err().is_dependency_unavailable());

        clock.advance(1);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);
    }

    #[tokio::test]
    async fn closes_after_success_threshold() {
        let (breaker, clock) = breaker(2, 100, 3);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        clock.advance(100);

        for _ in 0..2 {
            succeed(&breaker).await.unwrap();
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
        }
        succeed(&breaker).await.unwrap();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[tokio::test]
    async fn single_half_open_failure_reopens() {
        let (breaker, clock) = breaker(1, 100, 3);
        let _ = fail(&breaker).await;
        clock.advance(100);
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();

        let err = fail(&breaker).await.unwrap_err();
        assert!(err.is_dependency_unavailable());
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.success_count, 0);
        assert_eq!(snap.last_failure_time, clock.now_millis());

        // The recovery window restarts from the probe failure.
        clock.advance(50);
        assert!(succeed(&breaker).await.unwrap_err().is_dependency_unavailable());
        clock.advance(50);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().success_count, 1, "half-open entry resets successes");
    }

    #[tokio::test]
    async fn fallback_recovers_primary_failure_while_closed() {
        let (breaker, _) = breaker(5, 100, 1);
        let served = breaker
            .execute_with_fallback(
                || async { Err::<u32, _>(ResilienceError::Inner(StoreError::Transient("x".into()))) },
                || async { 3 },
            )
            .await;
        assert!(served.is_degraded());
        assert_eq!(served.value, 3);
        assert_eq!(breaker.snapshot().failures, 1, "recovered failures still count");
    }

    #[tokio::test]
    async fn execute_or_else_preserves_fallback_source() {
        let (breaker, _) = breaker(1, 1000, 1);
        let _ = fail(&breaker).await;
        let served = breaker
            .execute_or_else(
                || async { Ok::<_, ResilienceError<StoreError>>(1) },
                || async { Served::cached(9) },
            )
            .await;
        assert_eq!(served.source, Source::Cache);
    }

    #[tokio::test]
    async fn transitions_are_persisted() {
        let store = InMemoryKeyValueStore::new();
        let (breaker, _) = breaker(2, 1000, 1);
        let breaker = breaker.with_store(Arc::new(store.clone()));

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;

        let raw = store.get("circuit_breaker:store").await.unwrap().expect("persisted");
        let persisted: BreakerSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.state, CircuitState::Open);
        assert_eq!(persisted.failures, 2);
        assert!(raw.contains("\"lastFailureTime\""));
        assert!(raw.contains("\"OPEN\""));
    }

    #[tokio::test]
    async fn second_instance_observes_shared_state() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let clock = ManualClock::starting_at(5_000);
        let a = CircuitBreaker::new("store", config(1, 10_000, 1))
            .with_store(store.clone())
            .with_clock(clock.clone());
        let b = CircuitBreaker::new("store", config(1, 10_000, 1))
            .with_store(store)
            .with_clock(clock.clone());

        let _ = fail(&a).await;
        clock.advance(1);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = b
            .execute(|| async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<StoreError>>(())
            })
            .await;
        assert!(result.unwrap_err().is_dependency_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reconcile_interval_limits_store_reads() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let clock = ManualClock::starting_at(5_000);
        let cfg = || {
            CircuitBreakerConfig::new(1, Duration::from_secs(10), 1)
                .unwrap()
                .with_reconcile_interval(Duration::from_secs(5))
        };
        let a = CircuitBreaker::new("store", cfg()).with_store(store.clone()).with_clock(clock.clone());
        let b = CircuitBreaker::new("store", cfg()).with_store(store).with_clock(clock.clone());

        // b hydrates while the shared record is still closed.
        succeed(&b).await.unwrap();
        clock.advance(1);
        let _ = fail(&a).await;
        clock.advance(1);

        // Within the interval b keeps its local view.
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        clock.advance(5_000);
        assert!(succeed(&b).await.unwrap_err().is_dependency_unavailable());
    }

    #[tokio::test]
    async fn expired_shared_record_resets_idle_breaker() {
        let store = InMemoryKeyValueStore::new();
        let clock = ManualClock::starting_at(10_000);
        let cfg = CircuitBreakerConfig::new(1, Duration::from_secs(600), 1)
            .unwrap()
            .with_state_ttl(Duration::from_secs(60))
            .unwrap()
            .with_reconcile_interval(Duration::ZERO);
        let breaker = CircuitBreaker::new("store", cfg)
            .with_store(Arc::new(store.clone()))
            .with_clock(clock.clone());

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Record expired in the shared store and the breaker sat idle past the TTL.
        store.delete("circuit_breaker:store").await.unwrap();
        clock.advance(60_000);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_break_calls() {
        let store = InMemoryKeyValueStore::new();
        store.set_unavailable(true);
        let (breaker, _) = breaker(1, 1000, 1);
        let breaker = breaker.with_store(Arc::new(store));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_closes_and_persists() {
        let store = InMemoryKeyValueStore::new();
        let (breaker, _) = breaker(1, 1000, 1);
        let breaker = breaker.with_store(Arc::new(store.clone()));
        let _ = fail(&breaker).await;
        breaker.reset().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let raw = store.get("circuit_breaker:store").await.unwrap().unwrap();
        assert!(raw.contains("CLOSED"));
    }

    #[tokio::test]
    async fn malformed_shared_record_is_discarded() {
        let store = InMemoryKeyValueStore::new();
        store.set("circuit_breaker:store", "nonsense".into(), None).await.unwrap();
        let (breaker, _) = breaker(1, 1000, 1);
        let breaker = breaker.with_store(Arc::new(store.clone()));
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Serves a garbage breaker record and refuses to delete it.
    #[derive(Debug)]
    struct UndeletableStore;

    #[async_trait::async_trait]
    impl KeyValueStore for UndeletableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, crate::CacheError> {
            Ok(Some("{not json".into()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<(), crate::CacheError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<bool, crate::CacheError> {
            Err(crate::CacheError::Backend("delete refused".into()))
        }

        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>, crate::CacheError> {
            Ok(Vec::new())
        }
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_delete_of_malformed_record_is_logged_and_tolerated() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (breaker, _) = breaker(1, 1000, 1);
        let breaker = breaker.with_store(Arc::new(UndeletableStore));
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("failed to delete malformed breaker record"));
        assert!(logs.contains("delete refused"));
    }
}
