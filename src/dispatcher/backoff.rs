//! Exponential retry backoff.
//!
//! ```text
//!     attempt:   1      2      3      4
//!     delay:     b     2b     4b     8b      (each ×0.8..1.2 with jitter)
//! ```

use rand::Rng;
use std::time::Duration;

/// Largest exponent applied; keeps `2^n` from overflowing.
const MAX_EXPONENT: u32 = 16;

/// Upper bound for any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Relative jitter applied in both directions.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before the retry that follows `attempt` (1-based).
///
/// `base * 2^(attempt-1)`, capped at [`MAX_BACKOFF`], then scaled by a random
/// factor in `[1 - JITTER_FRACTION, 1 + JITTER_FRACTION]` when `jitter` is set.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: bool) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    let delay = base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF);
    if !jitter || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1, false), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, false), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 4, false), Duration::from_millis(800));
        // attempt 0 is treated like the first attempt
        assert_eq!(backoff_delay(base, 0, false), Duration::from_millis(100));
    }

    #[test]
    fn test_capped() {
        let delay = backoff_delay(Duration::from_secs(10), 40, false);
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let delay = backoff_delay(base, 2, true);
            assert!(delay >= Duration::from_millis(1599), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2401), "{:?}", delay);
        }
        assert_eq!(backoff_delay(Duration::ZERO, 3, true), Duration::ZERO);
    }
}
