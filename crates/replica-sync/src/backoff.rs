//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule for re-submissions and listener reconnects.
///
/// The nominal delay for attempt `n` (1-based) is `base * factor^(n-1)`,
/// capped at `cap`. The actual delay is the nominal one scaled by a uniform
/// factor in `[1 - jitter, 1 + jitter]`, and never exceeds `cap`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Relative jitter, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt `attempt`, without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before attempt `attempt`, with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }

        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(scale).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_doubles_until_cap() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.nominal(1), Duration::from_millis(500));
        assert_eq!(backoff.nominal(2), Duration::from_millis(1000));
        assert_eq!(backoff.nominal(4), Duration::from_millis(4000));
        assert_eq!(backoff.nominal(7), Duration::from_secs(30));
        assert_eq!(backoff.nominal(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = BackoffConfig::default();
        for _ in 0..200 {
            let d = backoff.delay(3);
            assert!(d >= Duration::from_millis(1600), "{d:?}");
            assert!(d <= Duration::from_millis(2400), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = BackoffConfig::default();
        for _ in 0..200 {
            assert!(backoff.delay(20) <= backoff.cap);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let backoff = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.delay(2), Duration::from_millis(1000));
    }
}
