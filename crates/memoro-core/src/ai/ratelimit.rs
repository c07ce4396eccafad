// Sliding-window rate limiter, one per provider. Requests inside the last
// minute are counted; the optional burst allowance rides on top of the RPM
// budget. A denied acquire is provider-fatal for the current request — the
// router falls through to the next candidate.

use crate::types::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter { config, window: Mutex::new(VecDeque::new()) }
    }

    /// Try to admit one request now. Admission appends to the window.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock();
        let now = Instant::now();
        while let Some(&front) = window.front() {
            if now.duration_since(front) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        let allowance = (self.config.rpm + self.config.burst) as usize;
        if window.len() >= allowance {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Requests admitted inside the current window.
    pub fn in_window(&self) -> usize {
        let window = self.window.lock();
        let now = Instant::now();
        window.iter().filter(|t| now.duration_since(**t) <= WINDOW).count()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_rpm_plus_burst() {
        let limiter = RateLimiter::new(RateLimitConfig { rpm: 3, burst: 2 });
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_window(), 5);
    }

    #[test]
    fn zero_burst_is_plain_rpm() {
        let limiter = RateLimiter::new(RateLimitConfig { rpm: 1, burst: 0 });
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
