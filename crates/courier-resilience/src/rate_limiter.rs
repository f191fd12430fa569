//! Sliding-window rate limiting.
//!
//! Admits at most `max_requests` operations in any rolling window of length
//! `interval`. The limiter keeps the timestamps of granted admissions in a
//! deque, evicts entries older than the interval, and grants a new admission
//! only while the window holds fewer than `max_requests` entries.
//!
//! Waiters are served in arrival order: callers queue on a fair tokio mutex
//! and only the head of the queue inspects the window. When the window is
//! full, the head sleeps until the oldest granted entry leaves it.

use courier_core::DispatchError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Admissions allowed per interval
    pub max_requests: u32,
    /// Length of the rolling window
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            interval: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration admitting `max_requests` per `interval`
    #[must_use]
    pub fn new(max_requests: u32, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
        }
    }
}

/// Point-in-time limiter statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Admissions currently inside the rolling window
    pub in_window: usize,
    /// Callers currently waiting for admission
    pub waiting: usize,
    /// Admissions allowed per interval
    pub limit: u32,
    /// Length of the rolling window
    pub interval: Duration,
}

impl RateLimiterStats {
    /// Window utilization as a percentage
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.in_window as f64 / f64::from(self.limit) * 100.0
    }
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sliding-window rate limiter with FIFO admission
pub struct RateLimiter {
    config: RateLimiterConfig,
    /// Granted admission timestamps, oldest first
    window: Mutex<VecDeque<Instant>>,
    /// Fair queue of callers waiting for admission
    turnstile: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
    enabled: bool,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// A `max_requests` of zero is treated as one.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let config = RateLimiterConfig {
            max_requests: config.max_requests.max(1),
            interval: config.interval,
        };
        Self {
            window: Mutex::new(VecDeque::with_capacity((config.max_requests as usize).min(1024))),
            config,
            turnstile: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
            enabled: true,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Create a disabled rate limiter (always admits)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::with_defaults()
        }
    }

    /// Check if rate limiting is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn evict(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&granted) = window.front() {
            if now.duration_since(granted) >= self.config.interval {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit now if the window has room, otherwise report when to retry
    fn try_admit(&self, now: Instant) -> Result<(), Instant> {
        let mut window = self.window.lock();
        self.evict(&mut window, now);

        if window.len() < self.config.max_requests as usize {
            window.push_back(now);
            trace!(in_window = window.len(), "Rate limiter admitted");
            return Ok(());
        }

        // The window is full, so it holds at least one entry.
        let oldest = window.front().copied().unwrap_or(now);
        Err(oldest + self.config.interval)
    }

    /// Wait until admission is granted.
    ///
    /// Callers are admitted in the order they called `acquire`.
    pub async fn acquire(&self) {
        if !self.enabled {
            return;
        }

        let _waiting = WaitGuard::enter(&self.waiting);
        let _turn = self.turnstile.lock().await;

        loop {
            match self.try_admit(Instant::now()) {
                Ok(()) => return,
                Err(ready_at) => {
                    let wait = ready_at.saturating_duration_since(Instant::now());
                    debug!(
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        waiting = self.waiting.load(Ordering::SeqCst),
                        "Rate limit window full, waiting"
                    );
                    tokio::time::sleep_until(ready_at).await;
                }
            }
        }
    }

    /// Wait for admission for at most `timeout`.
    ///
    /// A caller that times out leaves the queue without consuming a slot.
    ///
    /// # Errors
    /// Returns `DispatchError::RateLimitTimeout` if admission is not granted in time
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<(), DispatchError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| DispatchError::rate_limit_timeout(timeout))
    }

    /// Admit immediately or fail without waiting.
    ///
    /// Refuses while other callers are queued so that it never overtakes them.
    ///
    /// # Errors
    /// Returns `DispatchError::RateLimited` with the time until a slot frees up
    pub fn try_acquire(&self) -> Result<(), DispatchError> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let Ok(_turn) = self.turnstile.try_lock() else {
            let retry_after = self.next_release(now).unwrap_or(Duration::ZERO);
            return Err(DispatchError::rate_limited(retry_after));
        };

        self.try_admit(now)
            .map_err(|ready_at| DispatchError::rate_limited(ready_at.saturating_duration_since(now)))
    }

    fn next_release(&self, now: Instant) -> Option<Duration> {
        let window = self.window.lock();
        window
            .front()
            .map(|oldest| (*oldest + self.config.interval).saturating_duration_since(now))
    }

    /// Current limiter statistics
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let window = self.window.lock();
        let in_window = window
            .iter()
            .filter(|granted| now.duration_since(**granted) < self.config.interval)
            .count();

        RateLimiterStats {
            in_window,
            waiting: self.waiting.load(Ordering::SeqCst),
            limit: self.config.max_requests,
            interval: self.config.interval,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    fn limiter(max: u32, interval_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig::new(
            max,
            Duration::from_millis(interval_ms),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_within_limit_immediately() {
        let limiter = limiter(5, 1_000);
        let start = Instant::now();

        for _ in 0..5 {
            limiter.acquire().await;
        }

        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.stats().in_window, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_oldest_to_leave_window() {
        let limiter = limiter(2, 1_000);
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire().await;

        limiter.acquire().await;
        assert_eq!(Instant::now() - start, Duration::from_millis(1_000));

        limiter.acquire().await;
        assert_eq!(Instant::now() - start, Duration::from_millis(1_300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_in_any_window() {
        let limiter = limiter(3, 500);
        let grants = Arc::new(SyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                grants.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        let grants = grants.lock().clone();
        assert_eq!(grants.len(), 10);
        for (i, at) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|other| other.duration_since(*at) < Duration::from_millis(500))
                .count();
            assert!(in_window <= 3, "window starting at grant {i} admitted {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_admitted_in_arrival_order() {
        let limiter = limiter(1, 100);
        let order = Arc::new(SyncMutex::new(Vec::new()));

        limiter.acquire().await;

        let mut handles = Vec::new();
        for id in 0..5 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                order.lock().push(id);
            }));
            // Let the task reach the queue before spawning the next one.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let limiter = limiter(1, 1_000);
        limiter.acquire().await;

        let result = limiter.acquire_timeout(Duration::from_millis(200)).await;
        assert_eq!(
            result,
            Err(DispatchError::rate_limit_timeout(Duration::from_millis(200)))
        );
        assert_eq!(limiter.stats().waiting, 0);
        assert_eq!(limiter.stats().in_window, 1);

        assert!(limiter.acquire_timeout(Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire() {
        let limiter = limiter(2, 1_000);

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());

        tokio::time::advance(Duration::from_millis(400)).await;
        match limiter.try_acquire() {
            Err(DispatchError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("Expected RateLimited, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_waiters() {
        let limiter = limiter(1, 1_000);
        limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;

        let stats = limiter.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.in_window, 1);
        assert!((stats.utilization() - 100.0).abs() < f64::EPSILON);

        waiter.await.expect("waiter");
        assert_eq!(limiter.stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_always_admits() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1_000 {
            limiter.acquire().await;
        }
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.stats().in_window, 0);
    }

    #[test]
    fn test_zero_limit_treated_as_one() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(0, Duration::from_secs(1)));
        assert_eq!(limiter.config().max_requests, 1);
    }
}
