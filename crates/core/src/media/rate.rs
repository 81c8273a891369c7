use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{DEFAULT_FPS, MAX_FPS, MIN_FPS};

/// Target frame rate, shared between a publisher loop and its controller.
///
/// Clamped to `MIN_FPS..=MAX_FPS`. A change is picked up at the start of the
/// next tick; a tick already in progress keeps the interval it started with.
#[derive(Debug, Clone)]
pub struct RateBudget {
    fps: Arc<AtomicU32>,
}

impl RateBudget {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: Arc::new(AtomicU32::new(clamp_fps(fps))),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    /// Update the target. Returns the value actually applied.
    pub fn set_fps(&self, fps: u32) -> u32 {
        let applied = clamp_fps(fps);
        if applied != fps {
            tracing::debug!(requested = fps, applied, "frame rate clamped");
        }
        self.fps.store(applied, Ordering::Relaxed);
        applied
    }

    /// Minimum time between two sends.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps()
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new(DEFAULT_FPS)
    }
}

pub fn clamp_fps(fps: u32) -> u32 {
    fps.clamp(MIN_FPS, MAX_FPS)
}

/// Paces a loop to a [`RateBudget`].
///
/// Each tick runs from the instant it started to `started + interval`;
/// whatever the tick spent on capture and encode is subtracted from the
/// wait. A tick that overruns starts the next one immediately, so the
/// achieved rate can fall below the budget but never above it.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    budget: RateBudget,
}

impl RateLimiter {
    pub fn new(budget: RateBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Deadline for the tick that began at `tick_started`.
    pub fn next_deadline(&self, tick_started: Instant) -> Instant {
        tick_started + self.budget.interval()
    }

    /// Sleep out the remainder of the tick that began at `tick_started`.
    pub async fn wait(&self, tick_started: Instant) {
        tokio::time::sleep_until(self.next_deadline(tick_started)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_range() {
        let budget = RateBudget::new(100);
        assert_eq!(budget.fps(), MAX_FPS);
        assert_eq!(budget.set_fps(0), MIN_FPS);
        assert_eq!(budget.set_fps(8), 8);
    }

    #[test]
    fn interval_matches_fps() {
        let budget = RateBudget::new(10);
        assert_eq!(budget.interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_compensates_for_work() {
        let limiter = RateLimiter::new(RateBudget::new(4));
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        limiter.wait(start).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(260), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_does_not_sleep() {
        let limiter = RateLimiter::new(RateBudget::new(4));
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let before = Instant::now();
        limiter.wait(start).await;
        assert!(before.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn shared_budget_sees_updates() {
        let budget = RateBudget::new(6);
        let limiter = RateLimiter::new(budget.clone());
        budget.set_fps(12);
        assert_eq!(limiter.budget().fps(), 12);
    }
}
