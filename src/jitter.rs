//! Jitter to keep concurrent callers from retrying in lockstep.
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional(r)`: the delay is perturbed by a uniform offset in `[-r, +r]` of itself and
//!   floored at zero. The standard ratio is 10%.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

/// Spread applied by [`Jitter::standard`].
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Uniform perturbation of up to `ratio` of the delay in either direction.
    Proportional(f64),
}

impl Jitter {
    /// ±10% uniform jitter.
    pub fn standard() -> Self {
        Jitter::Proportional(DEFAULT_JITTER_RATIO)
    }

    /// Uniform jitter of ±`ratio`; `ratio` must lie in `[0.0, 1.0]`.
    pub fn proportional(ratio: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::InvalidJitterRatio(ratio));
        }
        Ok(Jitter::Proportional(ratio))
    }

    /// `Jitter::standard()` when enabled, `Jitter::None` otherwise.
    pub fn enabled(on: bool) -> Self {
        if on {
            Self::standard()
        } else {
            Jitter::None
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Jitter::None)
    }

    /// Largest delay this jitter can produce from `delay`.
    pub fn upper_bound(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => delay.mul_f64(1.0 + ratio),
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => {
                if delay.is_zero() || *ratio == 0.0 {
                    return delay;
                }
                let offset = rng.random_range(-*ratio..=*ratio);
                let millis = delay.as_secs_f64() * 1000.0 * (1.0 + offset);
                Duration::from_millis(millis.max(0.0).round() as u64)
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn standard_jitter_stays_within_ten_percent() {
        let jitter = Jitter::standard();
        let delay = Duration::from_millis(2000);
        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(1800), "{:?} below floor", jittered);
            assert!(jittered <= Duration::from_millis(2200), "{:?} above ceiling", jittered);
        }
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let jitter = Jitter::standard();
        let delay = Duration::from_millis(1000);
        let a = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        let b = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn full_ratio_never_goes_negative() {
        let jitter = Jitter::proportional(1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let jittered = jitter.apply_with_rng(Duration::from_millis(10), &mut rng);
            assert!(jittered <= Duration::from_millis(20));
        }
    }

    #[test]
    fn zero_delay_is_untouched() {
        assert_eq!(Jitter::standard().apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        assert!(matches!(Jitter::proportional(1.5), Err(ConfigError::InvalidJitterRatio(_))));
        assert!(Jitter::proportional(-0.1).is_err());
        assert!(Jitter::proportional(f64::NAN).is_err());
    }

    #[test]
    fn upper_bound_accounts_for_spread() {
        let bound = Jitter::standard().upper_bound(Duration::from_secs(10));
        assert!(bound >= Duration::from_millis(10_999) && bound <= Duration::from_millis(11_001));
        assert_eq!(Jitter::None.upper_bound(Duration::from_secs(10)), Duration::from_secs(10));
    }
}
