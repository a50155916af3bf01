//! Per-provider circuit breaker over a rolling sample window.
//!
//! Opens when the recent error rate crosses the threshold with enough
//! samples to be meaningful; while open, calls fail fast so the caller can
//! fall back instead of queueing on a dying provider.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tunables. Defaults: 60 s window, ≥20 samples, >50 % error rate
/// opens the breaker for 30 s.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_samples: usize,
    pub failure_threshold: f64,
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_samples: 20,
            failure_threshold: 0.5,
            open_for: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        CircuitBreaker {
            cfg,
            state: Mutex::new(BreakerState {
                samples: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. An elapsed open interval
    /// closes the breaker and resets the window.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.opened_at {
            None => true,
            Some(opened) => {
                if opened.elapsed() >= self.cfg.open_for {
                    info!("circuit breaker closing after open interval");
                    state.opened_at = None;
                    state.samples.clear();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record one call outcome and re-evaluate the window.
    pub fn record(&self, ok: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.samples.push_back((now, ok));
        let horizon = now.checked_sub(self.cfg.window);
        while let Some((t, _)) = state.samples.front() {
            match horizon {
                Some(h) if *t < h => {
                    state.samples.pop_front();
                }
                _ => break,
            }
        }

        if state.opened_at.is_some() || state.samples.len() < self.cfg.min_samples {
            return;
        }
        let failures = state.samples.iter().filter(|(_, ok)| !ok).count();
        let rate = failures as f64 / state.samples.len() as f64;
        if rate > self.cfg.failure_threshold {
            warn!(
                failures,
                samples = state.samples.len(),
                "circuit breaker opening"
            );
            state.opened_at = Some(now);
        }
    }

    /// Test/ops visibility: is the breaker currently open?
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.opened_at {
            Some(opened) => opened.elapsed() < self.cfg.open_for,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_samples: 10,
            failure_threshold: 0.5,
            open_for: Duration::from_millis(100),
        }
    }

    #[test]
    fn stays_closed_below_min_samples() {
        let breaker = CircuitBreaker::new(test_cfg());
        for _ in 0..9 {
            breaker.record(false);
        }
        assert!(breaker.allow());
    }

    #[test]
    fn opens_past_the_error_threshold() {
        let breaker = CircuitBreaker::new(test_cfg());
        for _ in 0..4 {
            breaker.record(true);
        }
        for _ in 0..7 {
            breaker.record(false);
        }
        assert!(!breaker.allow());
    }

    #[test]
    fn mostly_healthy_traffic_keeps_it_closed() {
        let breaker = CircuitBreaker::new(test_cfg());
        for i in 0..40 {
            breaker.record(i % 4 != 0); // 25% failures
        }
        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn closes_again_after_the_open_interval() {
        let breaker = CircuitBreaker::new(test_cfg());
        for _ in 0..12 {
            breaker.record(false);
        }
        assert!(!breaker.allow());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.allow());
        // Window was reset; a single new failure must not re-open it.
        breaker.record(false);
        assert!(breaker.allow());
    }
}
