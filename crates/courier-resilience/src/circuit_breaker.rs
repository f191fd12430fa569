//! Circuit breaker guarding a single provider.
//!
//! Fails fast while a provider is known to be down and lets a probe through
//! once the recovery timeout has elapsed.
//!
//! # State Machine
//!
//! ```text
//!                  ┌─────────────────────────┐
//!                  │         CLOSED          │
//!                  │ ● All requests allowed  │
//!                  │ ● Counting failures     │
//!                  └─────────────────────────┘
//!                     │                  ▲
//!   threshold reached │                  │ probe succeeds
//!                     ▼                  │
//!  ┌─────────────────────────┐        ┌───────────────────────┐
//!  │          OPEN           │        │       HALF-OPEN       │
//!  │ ● Requests rejected     │ ─────▶ │ ● Next call is a      │
//!  │ ● Provider not called   │timeout │   recovery probe      │
//!  └─────────────────────────┘        └───────────────────────┘
//!                ▲                               │
//!                └──────── probe fails ──────────┘
//! ```
//!
//! Half-open is not stored. It is what an open breaker reports once the
//! recovery timeout has passed since the last failure.

use courier_core::{DispatchError, EventContext, EventSink, TracingSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls
    Open,
    /// Recovery timeout elapsed; the next call probes the provider
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters exposed by a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// Total successful calls
    pub total_successes: u64,
    /// Total failed calls
    pub total_failures: u64,
    /// Calls rejected without reaching the provider
    pub total_rejections: u64,
    /// Times the breaker transitioned to open
    pub times_opened: u64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    open: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    times_opened: u64,
}

impl BreakerInner {
    fn state_at(&self, now: Instant, recovery_timeout: Duration) -> CircuitState {
        if !self.open {
            return CircuitState::Closed;
        }
        match self.last_failure {
            Some(at) if now.duration_since(at) < recovery_timeout => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

/// Circuit breaker for one provider
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
            sink: Arc::new(TracingSink),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Route transition events to the given sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Name of the guarded provider
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .state_at(Instant::now(), self.config.recovery_timeout)
    }

    /// Snapshot of the breaker counters
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state_at(Instant::now(), self.config.recovery_timeout),
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            times_opened: inner.times_opened,
        }
    }

    /// Check whether a call may proceed
    ///
    /// # Errors
    /// Returns `DispatchError::CircuitOpen` while open within the recovery timeout
    pub fn check(&self) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        match inner.state_at(Instant::now(), self.config.recovery_timeout) {
            CircuitState::Open => {
                inner.total_rejections += 1;
                debug!(provider = %self.name, "Circuit open, rejecting call");
                Err(DispatchError::circuit_open(&self.name))
            }
            CircuitState::HalfOpen => {
                debug!(provider = %self.name, "Circuit half-open, allowing probe");
                Ok(())
            }
            CircuitState::Closed => Ok(()),
        }
    }

    /// Record a successful call; closes the breaker
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let was_open = inner.open;
        inner.open = false;
        inner.consecutive_failures = 0;
        inner.total_successes += 1;
        drop(inner);

        if was_open {
            info!(provider = %self.name, "Circuit breaker closed after successful probe");
        }
    }

    /// Record a failed call; opens the breaker once the threshold is reached
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.state_at(now, self.config.recovery_timeout);

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        inner.last_failure = Some(now);

        let opened = inner.consecutive_failures >= self.config.failure_threshold.max(1)
            && before != CircuitState::Open;
        if opened {
            inner.open = true;
            inner.times_opened += 1;
        }
        let failures = inner.consecutive_failures;
        drop(inner);

        if opened {
            warn!(
                provider = %self.name,
                consecutive_failures = failures,
                recovery_timeout_ms =
                    u64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(u64::MAX),
                "Circuit breaker opened"
            );
            self.sink.info(
                "Circuit breaker opened",
                &EventContext::new()
                    .with_provider(&self.name)
                    .with_field("event", "circuit_opened")
                    .with_field("consecutive_failures", failures)
                    .with_field("previous_state", before),
            );
        }
    }

    /// Force the breaker closed and clear the failure counter
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.open = false;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    /// Execute `op` through the breaker.
    ///
    /// While open within the recovery timeout, `op` is not invoked.
    ///
    /// # Errors
    /// Returns `DispatchError::CircuitOpen` when short-circuited, otherwise
    /// propagates the error returned by `op`
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.check()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
