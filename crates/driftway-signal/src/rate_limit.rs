//! Rate limiter for joins with guessable codes
//!
//! Pair keys are five digits and public room codes five characters, so both
//! can be enumerated. Every `pair-device-join` and `join-public-room` attempt
//! is recorded in a sliding window; once more than `max_attempts` attempts
//! fall inside the window the request is rejected. The connection survives.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use driftway_core::RateLimitConfig;

/// Sliding-window attempt counter owned by a single peer
#[derive(Debug)]
pub struct JoinRateLimiter {
    window: Duration,
    max_attempts: usize,
    /// Timestamps of recent attempts, oldest first
    attempts: VecDeque<Instant>,
}

impl JoinRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_attempts: config.max_attempts,
            attempts: VecDeque::new(),
        }
    }

    /// Record an attempt now and report whether the limit is reached
    pub fn limit_reached(&mut self) -> bool {
        self.limit_reached_at(Instant::now())
    }

    /// Record an attempt at `now` and report whether the limit is reached
    pub fn limit_reached_at(&mut self, now: Instant) -> bool {
        self.attempts.push_back(now);
        self.cleanup(now);

        let reached = self.attempts.len() > self.max_attempts;
        if reached {
            debug!(
                "Join rate limit reached: {} attempts in {:?}",
                self.attempts.len(),
                self.window
            );
        }
        reached
    }

    /// Drop attempts outside the window
    fn cleanup(&mut self, now: Instant) {
        while let Some(oldest) = self.attempts.front() {
            if now.duration_since(*oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> JoinRateLimiter {
        JoinRateLimiter::new(&RateLimitConfig::default())
    }

    #[test]
    fn test_sixth_attempt_is_limited() {
        let mut limiter = limiter();
        let start = Instant::now();

        for i in 0..5 {
            assert!(!limiter.limit_reached_at(start + Duration::from_millis(i * 100)));
        }
        assert!(limiter.limit_reached_at(start + Duration::from_millis(600)));
    }

    #[test]
    fn test_window_elapses() {
        let mut limiter = limiter();
        let start = Instant::now();

        for _ in 0..6 {
            limiter.limit_reached_at(start);
        }

        // Everything recorded at `start` falls out of the window
        let later = start + Duration::from_secs(10);
        assert!(!limiter.limit_reached_at(later));
        assert_eq!(limiter.attempts.len(), 1);
    }

    #[test]
    fn test_rejected_attempts_still_count() {
        let mut limiter = limiter();
        let start = Instant::now();

        for _ in 0..8 {
            limiter.limit_reached_at(start);
        }

        // Half the window later the burst is still inside it
        assert!(limiter.limit_reached_at(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_custom_config() {
        let config = RateLimitConfig {
            window_secs: 1,
            max_attempts: 1,
        };
        let mut limiter = JoinRateLimiter::new(&config);
        let start = Instant::now();

        assert!(!limiter.limit_reached_at(start));
        assert!(limiter.limit_reached_at(start));
        assert!(!limiter.limit_reached_at(start + Duration::from_secs(2)));
    }
}
