//! Retry shape: exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff tunables. Defaults: base 500 ms, cap 15 s, 4 attempts total.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_ms: 500,
            cap_ms: 15_000,
            max_attempts: 4,
        }
    }
}

/// Delay before retry number `attempt` (1-based: the delay after the first
/// failure is `attempt = 1`). Full jitter: uniform in
/// `[0, min(cap, base * 2^(attempt-1))]`.
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let ceiling = cfg
        .base_ms
        .saturating_mul(1u64 << exp)
        .min(cfg.cap_ms)
        .max(1);
    let ms = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_the_jitter_envelope() {
        let cfg = RetryConfig::default();
        for attempt in 1..=6 {
            let ceiling = (cfg.base_ms * (1 << (attempt - 1))).min(cfg.cap_ms);
            for _ in 0..50 {
                let d = backoff_delay(&cfg, attempt);
                assert!(d.as_millis() as u64 <= ceiling, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn envelope_is_capped() {
        let cfg = RetryConfig::default();
        // Far past the doubling range the cap rules.
        for _ in 0..50 {
            assert!(backoff_delay(&cfg, 30).as_millis() as u64 <= cfg.cap_ms);
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let cfg = RetryConfig::default();
        let _ = backoff_delay(&cfg, u32::MAX);
    }
}
