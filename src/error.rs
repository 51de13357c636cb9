//! Error types for the resilience layer.
//!
//! `ResilienceError<E>` is what policies surface to their callers; `E` is the error produced by
//! the guarded operation itself. `StoreError` classifies backing-store failures into retryable
//! and non-retryable kinds.
use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::time::Duration;

/// Unified error type for pool, retry, and circuit breaker policies.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// No pooled connection became free within the acquire timeout.
    PoolExhausted { waited: Duration, max_connections: usize },
    /// The circuit breaker refused the call and no fallback was supplied.
    DependencyUnavailable { dependency: String, state: CircuitState },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted { waited, max_connections } => write!(
                f,
                "connection pool exhausted: no connection freed within {:?} ({} in use)",
                waited, max_connections
            ),
            Self::DependencyUnavailable { dependency, state } => {
                write!(f, "dependency '{}' unavailable (circuit {})", dependency, state)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<E> for ResilienceError<E> {
    fn from(e: E) -> Self {
        Self::Inner(e)
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to pool exhaustion.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Check if this error was raised by an open circuit.
    pub fn is_dependency_unavailable(&self) -> bool {
        matches!(self, Self::DependencyUnavailable { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Map the inner error, leaving policy variants untouched.
    pub fn map_inner<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::PoolExhausted { waited, max_connections } => {
                ResilienceError::PoolExhausted { waited, max_connections }
            }
            Self::DependencyUnavailable { dependency, state } => {
                ResilienceError::DependencyUnavailable { dependency, state }
            }
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

/// Failures reported by the backing relational store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Network, connection, or timeout-class failure; safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store refused to hand out a new connection (rate limited, overloaded).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The request itself is bad (malformed input, constraint violation); retrying cannot help.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unavailable(_))
    }
}

/// Failures from the key-value store backing the cache and breaker persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("key-value backend failure: {0}")]
    Backend(String),
    #[error("failed to serialize cache value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be > 0 (got {provided})")]
    MustBePositive { field: &'static str, provided: u64 },
    #[error("{field} must be >= {floor_field} ({provided} < {floor})")]
    BelowFloor { field: &'static str, floor_field: &'static str, provided: u64, floor: u64 },
    #[error("{field} must be <= {ceiling} (got {provided})")]
    AboveCeiling { field: &'static str, provided: u64, ceiling: u64 },
    #[error("backoff_factor must be a finite number >= 1.0 (got {0})")]
    InvalidBackoffFactor(f64),
    #[error("jitter ratio must be within [0.0, 1.0] (got {0})")]
    InvalidJitterRatio(f64),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}
