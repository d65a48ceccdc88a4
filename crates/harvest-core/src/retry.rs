//! Per-segment retry decisions.

use std::time::Duration;

use crate::segment::Segment;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch again once the delay has elapsed.
    RetryAfter(Duration),
    /// The attempt ceiling is reached; the segment fails terminally.
    GiveUp,
}

/// Bounded, deterministic retry schedule.
///
/// The delay before attempt `n + 1` is `backoff[n - 1]`; attempts past the
/// end of the table reuse its last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: vec![Duration::from_secs(60), Duration::from_secs(300)],
        }
    }
}

impl RetryPolicy {
    /// Default attempt ceiling.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Creates a policy. A zero ceiling is raised to one attempt.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempts_made`.
    #[must_use]
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let index = attempts_made.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decides what happens to a segment whose latest attempt just failed.
    #[must_use]
    pub fn decide(&self, segment: &Segment) -> RetryDecision {
        if segment.attempt_count >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_after(segment.attempt_count))
        }
    }

    /// Worst-case time a segment spends waiting between attempts.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }
}
