//! Jittered exponential backoff shared by every reconnecting transport.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters. Attempt `k` waits somewhere in `[c/2, c)` where
/// `c = min(base_ms * 2^k, cap_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_ms: 1000,
            cap_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay for `attempt`.
    pub fn ceiling_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    /// Delay for `attempt` using `rng` for jitter.
    pub fn delay_ms_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let ceiling = self.ceiling_ms(attempt);
        let half = ceiling / 2;
        let spread = ceiling - half;
        if spread == 0 {
            return ceiling;
        }
        (half + rng.gen_range(0..spread)).min(self.cap_ms)
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay_ms_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_ms(0), 1000);
        assert_eq!(policy.ceiling_ms(1), 2000);
        assert_eq!(policy.ceiling_ms(5), 32_000);
        assert_eq!(policy.ceiling_ms(6), 60_000);
        assert_eq!(policy.ceiling_ms(200), 60_000);
    }

    #[test]
    fn test_delay_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..16 {
            let ceiling = policy.ceiling_ms(attempt);
            for _ in 0..200 {
                let d = policy.delay_ms_with(attempt, &mut rng);
                assert!(d <= ceiling, "attempt {attempt}: {d} > {ceiling}");
                assert!(d >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_delay_grows_in_expectation() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mean = |attempt: u32, rng: &mut StdRng| -> f64 {
            let total: u64 = (0..500).map(|_| policy.delay_ms_with(attempt, rng)).sum();
            total as f64 / 500.0
        };
        let means: Vec<f64> = (0..6).map(|k| mean(k, &mut rng)).collect();
        assert!(means.windows(2).all(|w| w[0] < w[1]), "{means:?}");
    }

    #[test]
    fn test_zero_base_never_waits() {
        let policy = RetryPolicy {
            base_ms: 0,
            cap_ms: 100,
        };
        assert_eq!(policy.delay_ms(3), 0);
    }
}
