use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay.
///
/// `delay(n)` is the wait before the reconnect that follows the `n`-th
/// consecutive failure: `base * factor^(n-1)`, clamped to `cap`. The
/// sequence is non-decreasing in `n`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let cap = self.config.cap;
        let factor = self.config.factor.max(1);
        let mut delay = self.config.base.min(cap);
        for _ in 1..consecutive_failures {
            if delay >= cap || factor == 1 {
                break;
            }
            delay = delay.checked_mul(factor).unwrap_or(cap).min(cap);
        }
        delay
    }

    pub fn cap(&self) -> Duration {
        self.config.cap
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
