//! In-process provider with configurable failure behaviour.
//!
//! Used for demos, local development and tests. Every knob defaults to a
//! provider that always succeeds immediately and reports itself healthy.

use async_trait::async_trait;
use courier_core::{DispatchError, HealthStatus, MessageProvider, SendOutcome, SendRequest};
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Simulated message provider
#[derive(Debug)]
pub struct SimulatedProvider {
    name: String,
    failure_rate: f64,
    fail_first: u32,
    latency: Duration,
    health: Option<HealthStatus>,
    health_failure_rate: f64,
    broken_health_check: bool,
    sends: AtomicU32,
    failures: AtomicU32,
    health_checks: AtomicU64,
}

impl SimulatedProvider {
    /// Create a provider that always succeeds
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_rate: 0.0,
            fail_first: 0,
            latency: Duration::ZERO,
            health: None,
            health_failure_rate: 0.0,
            broken_health_check: false,
            sends: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            health_checks: AtomicU64::new(0),
        }
    }

    /// Fail each send with the given probability, clamped to `[0, 1]`
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fail the first `n` sends, then fall back to the failure rate
    #[must_use]
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Fail every send and report unhealthy
    #[must_use]
    pub fn always_failing(mut self) -> Self {
        self.failure_rate = 1.0;
        self.health = Some(HealthStatus::Unhealthy);
        self
    }

    /// Delay each send and health probe by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report a fixed health status
    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    /// Report unhealthy with the given probability on each probe
    #[must_use]
    pub fn with_health_failure_rate(mut self, rate: f64) -> Self {
        self.health_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Make every health probe return an error
    #[must_use]
    pub fn with_broken_health_check(mut self) -> Self {
        self.broken_health_check = true;
        self
    }

    /// Number of sends attempted against this provider
    #[must_use]
    pub fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of sends that failed
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Number of health probes served
    #[must_use]
    pub fn health_check_count(&self) -> u64 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn should_fail(&self, nth: u32) -> bool {
        if nth <= self.fail_first {
            return true;
        }
        match self.failure_rate {
            r if r <= 0.0 => false,
            r if r >= 1.0 => true,
            r => rand::thread_rng().gen_bool(r),
        }
    }
}

#[async_trait]
impl MessageProvider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, DispatchError> {
        let nth = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.should_fail(nth) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            debug!(provider = %self.name, to = %request.to, "Simulated send failure");
            return Err(DispatchError::provider(
                &self.name,
                format!("{} simulated failure", self.name),
                true,
            ));
        }

        let message_id = format!("{}-{}", self.name, uuid::Uuid::new_v4());
        debug!(provider = %self.name, to = %request.to, message_id = %message_id, "Simulated send");
        Ok(SendOutcome::delivered(&self.name, message_id))
    }

    async fn health_check(&self) -> Result<HealthStatus, DispatchError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.broken_health_check {
            return Err(DispatchError::provider(
                &self.name,
                "health endpoint unreachable",
                false,
            ));
        }
        if let Some(health) = self.health {
            return Ok(health);
        }
        if self.health_failure_rate > 0.0 && rand::thread_rng().gen_bool(self.health_failure_rate) {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(HealthStatus::Healthy)
    }
}
