//! Retry backoff

use rand::Rng;
use std::time::Duration;

/// Exponential backoff, capped, with optional jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay after `failures` consecutive failures.
    ///
    /// Jitter draws from the upper half of the exponential delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_and_capped() {
        let backoff = Backoff::default().with_jitter(false);
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(6), Duration::from_secs(32));
        assert_eq!(backoff.delay(7), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        for failures in 1..10 {
            let ceiling = Backoff::default().with_jitter(false).delay(failures);
            let delay = backoff.delay(failures);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }
}
