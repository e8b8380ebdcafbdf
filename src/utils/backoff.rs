use std::time::Duration;

use crate::models::RetryConfig;

/// Sleep after the given (1-based) attempt fails:
/// `min(baseDelayMs · multiplier^(attempt − 1), maxDelayMs)`.
pub fn delay_after_attempt(config: &RetryConfig, attempt_number: u32) -> Duration {
    let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(config.max_delay_ms as f64)
    } else {
        config.max_delay_ms as f64
    };
    Duration::from_millis(capped.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(base: u64, multiplier: f64, cap: u64) -> RetryConfig {
        RetryConfig {
            base_delay_ms: base,
            backoff_multiplier: multiplier,
            max_delay_ms: cap,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn doubles_until_capped() {
        let cfg = config(1_000, 2.0, 30_000);
        let delays: Vec<u64> = (1..=8)
            .map(|n| delay_after_attempt(&cfg, n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let cfg = config(1_000, 10.0, 30_000);
        assert_eq!(delay_after_attempt(&cfg, u32::MAX), Duration::from_millis(30_000));
    }

    proptest! {
        #[test]
        fn never_exceeds_cap_and_never_shrinks(
            base in 0u64..10_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..40,
        ) {
            let cfg = config(base, multiplier, base + extra);
            let current = delay_after_attempt(&cfg, attempt);
            let next = delay_after_attempt(&cfg, attempt + 1);
            prop_assert!(current.as_millis() as u64 <= base + extra);
            prop_assert!(next >= current);
        }
    }
}
