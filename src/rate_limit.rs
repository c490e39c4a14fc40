// Proactive request throttling for the openFDA client.
//
// Sliding-window log: the instants of the last `limit` requests are kept and a
// new request waits until the oldest one leaves the window. Unlike a refilling
// token bucket this bounds the count in *every* rolling window, not just on
// average.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::warn;

pub const MINUTE: Duration = Duration::from_secs(60);

/// Sliding-window rate limiter shared by all attempts of one client.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1) as usize;
        Self {
            limit,
            window,
            sent: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, MINUTE)
    }

    pub fn limit(&self) -> u32 {
        self.limit as u32
    }

    /// Wait until one more request fits in the window, then claim it.
    pub async fn acquire(&self) {
        let mut sent = self.sent.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = sent.front() {
                if now.duration_since(oldest) >= self.window {
                    sent.pop_front();
                } else {
                    break;
                }
            }
            if sent.len() < self.limit {
                sent.push_back(now);
                return;
            }
            let Some(&oldest) = sent.front() else {
                continue;
            };
            let wake = oldest + self.window;
            warn!(
                limit = self.limit,
                wait_ms = wake.duration_since(now).as_millis() as u64,
                "request budget exhausted; throttling"
            );
            sleep_until(wake).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn requests_within_limit_do_not_wait() {
        let limiter = RateLimiter::per_minute(3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn request_over_limit_waits_for_window() {
        let limiter = RateLimiter::per_minute(2);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn every_rolling_window_stays_under_limit() {
        let limit = 3;
        let limiter = RateLimiter::per_minute(limit);
        let mut stamps = Vec::new();
        for i in 0..10u64 {
            limiter.acquire().await;
            stamps.push(Instant::now());
            // uneven spacing between callers
            tokio::time::sleep(Duration::from_secs(i * 7 % 25)).await;
        }
        for pair in stamps.windows(limit as usize + 1) {
            let span = pair[limit as usize].duration_since(pair[0]);
            assert!(span >= MINUTE, "{} requests within {:?}", limit + 1, span);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_is_treated_as_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(10));
        assert_eq!(limiter.limit(), 1);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
