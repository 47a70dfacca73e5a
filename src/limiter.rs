//! Sliding-window rate limiter with an optional short-window burst cap.
//!
//! Upstream quotas are per-minute-with-bursts, so a single token bucket is
//! not enough: the long window enforces sustained throughput while the burst
//! window stops a thundering herd when the long window has plenty of room.
//!
//! Two limiter instances exist per process (captioning API, drive API),
//! constructed once in the composition root and injected via `Arc`. They ARE
//! the shared quota accounting; multi-process deployments divide quota
//! statically per process in configuration.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One accounting window: grants inside `window` are retained, the rest
/// dropped on every check.
#[derive(Debug)]
struct Window {
    max: usize,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl Window {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            grants: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.grants.front() {
            if now.duration_since(front) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.grants.len() < self.max
    }

    /// When the oldest grant ages out, freeing a slot. Only meaningful while
    /// the window is full.
    fn next_free_at(&self) -> Option<Instant> {
        self.grants.front().map(|&front| front + self.window)
    }
}

/// Sliding-window counter plus optional burst cap. `acquire` blocks until
/// both windows have capacity, then records the grant in both.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

struct Inner {
    long: Window,
    burst: Option<Window>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                long: Window::new(max_per_window, window),
                burst: None,
            }),
        }
    }

    /// Convenience constructor for per-minute quotas.
    pub fn per_minute(max: usize) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    pub fn with_burst(mut self, burst_max: usize, burst_window: Duration) -> Self {
        self.inner.get_mut().burst = Some(Window::new(burst_max, burst_window));
        self
    }

    /// Waits until both windows have capacity, then records the grant.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                match inner.try_grant(Instant::now()) {
                    Ok(()) => return,
                    Err(until) => until.saturating_duration_since(Instant::now()),
                }
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| Error::RateLimitExhausted(timeout))
    }

    /// Grants currently inside the long window. Monitoring aid.
    pub async fn in_flight(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.long.prune(now);
        inner.long.grants.len()
    }
}

impl Inner {
    /// Grant if both windows allow it, otherwise return the earliest instant
    /// at which the saturated window frees a slot.
    fn try_grant(&mut self, now: Instant) -> std::result::Result<(), Instant> {
        self.long.prune(now);
        if let Some(burst) = self.burst.as_mut() {
            burst.prune(now);
        }

        let long_ok = self.long.has_capacity();
        let burst_ok = self.burst.as_ref().map_or(true, Window::has_capacity);

        if long_ok && burst_ok {
            self.long.grants.push_back(now);
            if let Some(burst) = self.burst.as_mut() {
                burst.grants.push_back(now);
            }
            return Ok(());
        }

        let mut until = now + Duration::from_millis(5);
        if !long_ok {
            if let Some(at) = self.long.next_free_at() {
                until = until.max(at);
            }
        }
        if !burst_ok {
            if let Some(at) = self.burst.as_ref().and_then(Window::next_free_at) {
                until = until.max(at);
            }
        }
        Err(until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn long_window_blocks_after_quota() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third grant only after the first ages out of the window.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_cap_throttles_within_long_window() {
        // Long window is wide open; burst allows 2 per second.
        let limiter =
            RateLimiter::new(100, Duration::from_secs(60)).with_burst(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_fails_when_exhausted() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire().await;

        let err = limiter
            .acquire_timeout(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        limiter.acquire().await;

        // First grant ages out at t=10, so the third grant lands then, not
        // at t=16 as a fixed-epoch counter would.
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
