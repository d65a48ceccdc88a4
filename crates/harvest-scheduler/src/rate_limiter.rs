//! Process-wide budget for calls to the execution API.

use std::collections::VecDeque;
use std::time::Duration;

use harvest_core::config::RateLimitConfig;
use harvest_core::metrics::RATE_LIMIT_WAIT;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Sliding-log limiter granting at most `permits_per_window` permits in any
/// rolling window.
///
/// `acquire` never fails; callers wait until the oldest grant leaves the
/// window. One instance is shared by every dispatch in the process.
#[derive(Debug)]
pub struct RateLimiter {
    permits_per_window: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter. A zero budget is raised to one permit.
    #[must_use]
    pub fn new(permits_per_window: usize, window: Duration) -> Self {
        let permits_per_window = permits_per_window.max(1);
        Self {
            permits_per_window,
            window,
            grants: Mutex::new(VecDeque::with_capacity(permits_per_window)),
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.permits_per_window, config.window())
    }

    #[must_use]
    pub const fn permits_per_window(&self) -> usize {
        self.permits_per_window
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Waits until a permit is available and takes it.
    pub async fn acquire(&self) {
        let started = Instant::now();
        loop {
            match self.try_grant(Instant::now()) {
                None => {
                    RATE_LIMIT_WAIT.observe(started.elapsed().as_secs_f64());
                    return;
                }
                Some(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limit budget exhausted");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Permits that could be granted right now without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        let mut grants = self.grants.lock();
        self.expire(&mut grants, Instant::now());
        self.permits_per_window - grants.len()
    }

    /// Records a grant at `now`, or returns how long until one frees up.
    fn try_grant(&self, now: Instant) -> Option<Duration> {
        let mut grants = self.grants.lock();
        self.expire(&mut grants, now);
        if grants.len() < self.permits_per_window {
            grants.push_back(now);
            return None;
        }
        grants
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    fn expire(&self, grants: &mut VecDeque<Instant>, now: Instant) {
        while grants
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            grants.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn grants_immediately_within_budget() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_oldest_grant_to_expire() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_the_window_budget() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(60)));
        let granted = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                let granted = granted.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    granted.lock().push(Instant::now());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let granted = granted.lock().clone();
        assert_eq!(granted.len(), 5);
        for start in &granted {
            let in_window = granted
                .iter()
                .filter(|t| **t >= *start && **t < *start + Duration::from_secs(60))
                .count();
            assert!(in_window <= 2, "{in_window} grants inside one window");
        }
    }

    #[test]
    fn zero_budget_is_raised_to_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.permits_per_window(), 1);
    }
}
