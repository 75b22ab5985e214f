//! Exponential backoff between retry attempts.
//!
//! | Attempt | Raw delay (initial 100ms, factor 2) | With jitter (×0.75–1.25) |
//! |---------|-------------------------------------|--------------------------|
//! | 1       | 100ms                               | 75–125ms                 |
//! | 2       | 200ms                               | 150–250ms                |
//! | 3       | 400ms                               | 300–500ms                |
//! | k       | min(100ms·2^(k-1), max_delay)       | raw × uniform(0.75,1.25) |

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, EngineError, EngineResult};

/// Lower bound of the jitter multiplier.
pub const JITTER_LOW: f64 = 0.75;
/// Upper bound of the jitter multiplier.
pub const JITTER_HIGH: f64 = 1.25;

/// Pure delay schedule. Attempts are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// Build a policy, rejecting a factor that would not grow the delay.
    pub fn new(
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        jitter: bool,
    ) -> Result<Self, ConfigError> {
        if !backoff_factor.is_finite() || backoff_factor <= 1.0 {
            return Err(ConfigError::validation(
                "backoff_factor",
                format!("must be > 1.0, got {backoff_factor}"),
            ));
        }
        if initial_delay > max_delay {
            return Err(ConfigError::validation(
                "initial_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        Ok(Self {
            initial_delay,
            backoff_factor,
            max_delay,
            jitter,
        })
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the retry that follows `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> EngineResult<Duration> {
        if attempt == 0 {
            return Err(EngineError::InvalidArgument(
                "backoff attempt numbering starts at 1".to_string(),
            ));
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Ok(Duration::from_secs_f64(capped))
    }

    /// Delay for `attempt`, applying jitter from `rng` when enabled.
    ///
    /// The same seed always yields the same sequence of delays.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> EngineResult<Duration> {
        let base = self.base_delay(attempt)?;
        if !self.jitter {
            return Ok(base);
        }
        let factor = rng.random_range(JITTER_LOW..=JITTER_HIGH);
        Ok(base.mul_f64(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            jitter,
        )
        .unwrap()
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy(false);
        assert_eq!(p.base_delay(1).unwrap(), Duration::from_millis(100));
        assert_eq!(p.base_delay(2).unwrap(), Duration::from_millis(200));
        assert_eq!(p.base_delay(3).unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn test_capped_at_max_delay() {
        let p = policy(false);
        assert_eq!(p.base_delay(5).unwrap(), Duration::from_secs(1));
        assert_eq!(p.base_delay(60).unwrap(), Duration::from_secs(1));
        assert_eq!(p.base_delay(u32::MAX).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_monotonic_without_jitter() {
        let p = policy(false);
        let mut rng = StdRng::seed_from_u64(1);
        let mut prev = Duration::ZERO;
        for k in 1..=40 {
            let d = p.delay(k, &mut rng).unwrap();
            assert!(d >= prev, "delay({k}) = {d:?} < {prev:?}");
            assert!(d <= p.max_delay());
            prev = d;
        }
    }

    #[test]
    fn test_attempt_zero_rejected() {
        let p = policy(false);
        assert!(matches!(
            p.base_delay(0),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_factor_must_exceed_one() {
        for factor in [1.0, 0.5, f64::NAN] {
            let err = BackoffPolicy::new(
                Duration::from_millis(10),
                factor,
                Duration::from_secs(1),
                false,
            )
            .unwrap_err();
            assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "backoff_factor"));
        }
    }

    #[test]
    fn test_jitter_within_bounds() {
        let p = policy(true);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = p.delay(2, &mut rng).unwrap();
            assert!(d >= Duration::from_millis(150), "{d:?}");
            assert!(d <= Duration::from_millis(250), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_deterministic_for_seed() {
        let p = policy(true);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for k in 1..10 {
            assert_eq!(p.delay(k, &mut a).unwrap(), p.delay(k, &mut b).unwrap());
        }
    }
}
