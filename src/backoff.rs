//! Exponential backoff for retry policies.
//!
//! Attempt semantics: attempt index `0` represents the initial call (no delay), and retries start
//! at `attempt = 1`, which waits exactly `base`. Each later retry multiplies by `factor` until
//! the delay reaches `max`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use resilient_store::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(1000))
//!     .with_max(Duration::from_millis(5000))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(1000));
//! assert_eq!(backoff.delay(2), Duration::from_millis(2000));
//! assert_eq!(backoff.delay(3), Duration::from_millis(4000));
//! assert_eq!(backoff.delay(4), Duration::from_millis(5000)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// `min(max, base * factor^(attempt-1))`, saturating at [`MAX_BACKOFF`].
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    /// Doubling backoff starting at `base`, capped only by [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: MAX_BACKOFF, factor: 2.0 }
    }

    /// Set the upper bound for any single delay. Must be > 0 and >= base.
    pub fn with_max(mut self, max: Duration) -> Result<Self, ConfigError> {
        if max.is_zero() {
            return Err(ConfigError::MustBePositive { field: "max_delay", provided: 0 });
        }
        if max < self.base {
            return Err(ConfigError::BelowFloor {
                field: "max_delay",
                floor_field: "base_delay",
                provided: millis(max),
                floor: millis(self.base),
            });
        }
        self.max = max.min(MAX_BACKOFF);
        Ok(self)
    }

    /// Set the growth factor between consecutive retries. Must be finite and >= 1.0.
    pub fn with_factor(mut self, factor: f64) -> Result<Self, ConfigError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor(factor));
        }
        self.factor = factor;
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Calculate the delay for a given attempt number (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        let uncapped = if scaled.is_finite() && scaled < MAX_BACKOFF.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            MAX_BACKOFF
        };
        // Round to whole milliseconds so float noise never shows up in computed delays.
        let rounded = Duration::from_millis(millis_rounded(uncapped));
        rounded.min(self.max)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn millis_rounded(d: Duration) -> u64 {
    let nanos = d.as_nanos();
    u64::try_from((nanos + 500_000) / 1_000_000).unwrap_or(u64::MAX)
}
