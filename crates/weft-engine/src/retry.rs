use std::time::Duration;

use weft_core::config::RetryConfig;

/// Exponential backoff before retry number `attempt` (0-based), with 0.8x to
/// 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    #[test]
    fn test_backoff_grows_with_jitter() {
        let c = config();
        for _ in 0..20 {
            let first = calculate_backoff(0, &c).as_millis();
            assert!((80..=120).contains(&first));
            let third = calculate_backoff(2, &c).as_millis();
            assert!((320..=480).contains(&third));
        }
    }

    #[test]
    fn test_backoff_capped() {
        let c = config();
        let capped = calculate_backoff(40, &c).as_millis();
        assert!(capped <= 1_200);
    }
}
