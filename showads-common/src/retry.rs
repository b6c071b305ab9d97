//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure retrying of a single bulk request.
use std::time::Duration;

use rand::Rng;

/// Wall clock bound of the whole retry sequence of one request.
pub const DEFAULT_RETRY_CEILING: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq)]
/// A retry policy to determine retry parameters for a request.
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// The backoff interval for the first retry; doubled for every further attempt.
    pub base_delay: Duration,
    /// Elapsed time after which no further retry is scheduled.
    pub ceiling: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ceiling: DEFAULT_RETRY_CEILING,
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Deterministic part of the delay before retrying after `attempt` (0 based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// `backoff(attempt)` plus a uniformly random jitter in `[0, base_delay]`.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let jitter = self
            .base_delay
            .mul_f64(rand::thread_rng().gen_range(0.0..=1.0));
        self.backoff(attempt).saturating_add(jitter)
    }

    /// Delay to sleep before the next attempt, or `None` when the retry budget or the ceiling
    /// would be exceeded. `elapsed` is measured from the first attempt.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        let delay = self.jittered_backoff(attempt);
        if elapsed.saturating_add(delay) > self.ceiling {
            return None;
        }

        Some(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
