//! Retry engine for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - `ResilienceError::Inner(E)` is retried when the retry predicate accepts it; a rejected error
//!   is returned immediately without consuming the remaining attempts.
//! - `ResilienceError::PoolExhausted` is always retryable.
//! - `ResilienceError::DependencyUnavailable` is never retried.
//! - When every attempt fails, the last error is returned unchanged.
//! - Before retry `n` (1-based) the engine waits `min(max_delay, base_delay * factor^(n-1))`,
//!   perturbed by jitter, on a non-blocking sleeper.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use resilient_store::{ResilienceError, RetryPolicy, StoreError};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<StoreError>::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_millis(50))
//!     .should_retry(StoreError::is_transient)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<StoreError>> = policy
//!     .execute(|| async { Err(ResilienceError::Inner(StoreError::Rejected("bad id".into()))) })
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::error::ConfigError;
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Immutable retry configuration for one operation class, shared by every invocation.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    name: Arc<str>,
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Operation class used for the backing store: 3 attempts, 1s doubling to 5s, jittered.
    pub fn for_store() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
            .name("store")
            .max_attempts(3)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
    }

    /// Operation class for slower third-party APIs: 5 attempts, 500ms doubling to 10s, jittered.
    pub fn for_external_api() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
            .name("external-api")
            .max_attempts(5)
            .base_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(10))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Upper bound on the time spent sleeping between attempts of a single execution.
    pub fn worst_case_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|retry| self.jitter.upper_bound(self.backoff.delay(retry)))
            .sum()
    }

    /// Execute an async operation with retry semantics, using the policy's predicate.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let predicate = self.should_retry.clone();
        self.execute_with(operation, move |e: &E| predicate(e)).await
    }

    /// Execute with a per-call retry predicate that overrides the policy's default.
    pub async fn execute_with<T, Fut, Op, P>(
        &self,
        mut operation: Op,
        is_retryable: P,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = match &err {
                ResilienceError::Inner(e) => is_retryable(e),
                ResilienceError::PoolExhausted { .. } => true,
                ResilienceError::DependencyUnavailable { .. } => false,
            };
            if !retryable {
                tracing::debug!(policy = %self.name, attempt, error = %err, "error is not retryable");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!(
                    policy = %self.name,
                    attempts = attempt,
                    error = %err,
                    "retry attempts exhausted"
                );
                return Err(err);
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            tracing::warn!(
                policy = %self.name,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed; retrying"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    name: String,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: Jitter::standard(),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Operation class name, used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Cap for any single delay; must be >= base delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between retries; must be >= 1.0.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Toggle the standard ±10% jitter.
    pub fn jitter_enabled(self, enabled: bool) -> Self {
        self.with_jitter(Jitter::enabled(enabled))
    }

    /// Default predicate deciding whether an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::MustBePositive { field: "max_attempts", provided: 0 });
        }
        let backoff = Backoff::exponential(self.base_delay)
            .with_factor(self.backoff_factor)?
            .with_max(self.max_delay)?;
        Ok(RetryPolicy {
            name: Arc::from(self.name),
            max_attempts: self.max_attempts,
            backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
