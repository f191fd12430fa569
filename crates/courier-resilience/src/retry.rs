//! Retry with exponential backoff.
//!
//! The first attempt runs immediately. The delay before attempt `n` (n ≥ 2) is
//! `initial_delay * 2^(n-2)`, optionally spread by a symmetric jitter
//! fraction. There is no ceiling unless `max_delay` is set. Delays are awaited on the tokio timer, so a
//! backing-off send never blocks other tasks.

use courier_core::DispatchError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Optional upper bound for any single delay
    #[serde(default, with = "humantime_serde")]
    pub max_delay: Option<Duration>,
    /// Jitter fraction (0.0 to 1.0) applied symmetrically to each delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: None,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with the given attempt budget and initial delay
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Cap every delay at `max_delay`
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Set the jitter fraction; clamped to `0.0..=1.0`, non-finite values
    /// disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = normalize_jitter(jitter);
        self
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Backoff delay before the given 1-based attempt, without jitter
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.cap(self.initial_delay.saturating_mul(2_u32.saturating_pow(exponent)))
    }

    /// Backoff delay before the given 1-based attempt
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.cap(apply_jitter(self.base_delay_for(attempt), self.jitter))
    }
}

fn normalize_jitter(jitter: f64) -> f64 {
    if jitter.is_finite() {
        jitter.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn apply_jitter(duration: Duration, jitter: f64) -> Duration {
    let jitter = normalize_jitter(jitter);
    if jitter <= 0.0 || duration.is_zero() {
        return duration;
    }

    let secs = duration.as_secs_f64();
    let range = secs * jitter;
    let offset = rand::thread_rng().gen_range(-range..=range);
    Duration::try_from_secs_f64((secs + offset).max(0.0)).unwrap_or(Duration::MAX)
}

/// Retry policy running an operation until it succeeds or the attempt budget
/// is spent
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a policy that makes exactly one attempt
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(RetryConfig::new(1, Duration::ZERO))
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Effective attempt budget; zero is treated as one
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Attempts are strictly
    /// sequential.
    ///
    /// # Errors
    /// Returns `DispatchError::RetriesExhausted` wrapping the last failure
    /// once every attempt has failed
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, DispatchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= max_attempts => {
                    warn!(attempts = attempt, error = %err, "Retries exhausted");
                    return Err(DispatchError::retries_exhausted(attempt, err));
                }
                Err(err) => {
                    let delay = self.config.delay_for(attempt + 1);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Run `op` with `max_attempts` attempts and exponential backoff starting at
/// `initial_delay`.
///
/// # Errors
/// Returns `DispatchError::RetriesExhausted` once every attempt has failed
pub async fn retry_with_backoff<F, Fut, T>(
    op: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, DispatchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    RetryPolicy::new(RetryConfig::new(max_attempts, initial_delay))
        .run(op)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn failure() -> DispatchError {
        DispatchError::provider("test", "unavailable", true)
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig::new(5, Duration::from_millis(100));

        assert_eq!(config.delay_for(1), Duration::ZERO);
        assert_eq!(config.delay_for(2), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(400));
        assert_eq!(config.delay_for(5), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::new(40, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));

        assert_eq!(config.delay_for(4), Duration::from_secs(4));
        assert_eq!(config.delay_for(5), Duration::from_secs(5));
        assert_eq!(config.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_uncapped_by_default() {
        let config = RetryConfig::new(6, Duration::from_secs(5));
        let delays: Vec<u64> = (2..=6).map(|n| config.delay_for(n).as_secs()).collect();

        assert_eq!(config.max_delay, None);
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let config = RetryConfig::new(u32::MAX, Duration::MAX).with_jitter(0.5);
        for _ in 0..20 {
            assert!(config.delay_for(200) >= Duration::from_secs(u64::MAX / 4));
        }
    }

    #[test]
    fn test_non_finite_jitter_disabled() {
        let config = RetryConfig::new(3, Duration::from_secs(2)).with_jitter(f64::NAN);
        assert_eq!(config.jitter, 0.0);
        assert_eq!(config.delay_for(2), Duration::from_secs(2));

        // Set directly, bypassing the builder
        let config = RetryConfig {
            jitter: f64::INFINITY,
            ..RetryConfig::new(3, Duration::from_secs(2))
        };
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(RetryConfig::default().with_jitter(4.0).jitter, 1.0);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::new(3, Duration::from_secs(10)).with_jitter(0.25);

        for _ in 0..100 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_millis(7_500));
            assert!(delay <= Duration::from_millis(12_500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_defaults();

        let result = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, DispatchError>(7) }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(RetryConfig::new(3, Duration::from_millis(100)));

        let result: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(DispatchError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, failure());
            }
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_double_between_attempts() {
        let started = Mutex::new(Vec::new());
        let policy = RetryPolicy::new(RetryConfig::new(4, Duration::from_millis(100)));

        let _ = policy
            .run(|_| {
                started.lock().push(Instant::now());
                async { Err::<(), _>(failure()) }
            })
            .await;

        let started = started.lock();
        assert_eq!(started.len(), 4);
        assert_eq!(started[1] - started[0], Duration::from_millis(100));
        assert_eq!(started[2] - started[1], Duration::from_millis(200));
        assert_eq!(started[3] - started[2], Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_mid_sequence() {
        let policy = RetryPolicy::new(RetryConfig::new(5, Duration::from_millis(10)));

        let result = policy
            .run(|attempt| async move {
                if attempt < 3 {
                    Err(failure())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure()) }
            },
            0,
            Duration::from_millis(10),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_policy() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::no_retry()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure()) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::RetriesExhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
