//! The top-level dispatcher.
//!
//! A logical send flows through these stages:
//! 1. Resolve the idempotency key, deriving one if the caller gave none
//! 2. Join or start the idempotent execution for that key
//! 3. Wait for rate-limiter admission
//! 4. Retry attempts against the active provider, each through its breaker
//! 5. After a failed attempt, probe the provider and fail over if unhealthy
//!
//! The status record for the key is updated along the way.

use crate::queue::{Deliver, DeliveryQueue, DeliveryTicket, QueueStatus};
use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    DeliveryStatus, DispatchError, EventSink, IdempotencyKey, SendOutcome, SendRequest,
};
use courier_providers::{ProviderPair, ProviderRole, ProviderSnapshot};
use courier_resilience::{IdempotencyStore, RateLimiter, RetryPolicy, TimeoutManager};
use courier_telemetry::DispatchMetrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared state behind a [`Dispatcher`]
pub(crate) struct DispatchCore {
    pub(crate) pair: ProviderPair,
    pub(crate) retry: RetryPolicy,
    pub(crate) limiter: RateLimiter,
    pub(crate) idempotency: IdempotencyStore<SendOutcome>,
    pub(crate) timeouts: TimeoutManager,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) metrics: Option<Arc<DispatchMetrics>>,
    pub(crate) statuses: DashMap<String, DeliveryStatus>,
    pub(crate) sequence: AtomicU64,
}

impl DispatchCore {
    async fn send(self: &Arc<Self>, request: SendRequest) -> Result<SendOutcome, DispatchError> {
        let key = match &request.idempotency_key {
            Some(key) => key.clone(),
            None => self.derive_key(&request),
        };

        self.statuses
            .entry(key.as_str().to_string())
            .or_insert_with(DeliveryStatus::pending);

        if let Some(metrics) = &self.metrics {
            metrics.record_idempotency_lookup(self.idempotency.get(key.as_str()).is_some());
        }

        let core = Arc::clone(self);
        let execution_key = key.clone();
        self.idempotency
            .execute(key.as_str(), move || async move {
                core.deliver_once(&execution_key, request).await
            })
            .await
    }

    fn derive_key(&self, request: &SendRequest) -> IdempotencyKey {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        request.derive_idempotency_key(Utc::now(), sequence)
    }

    /// One logical send; runs inside the idempotent execution for `key`.
    async fn deliver_once(
        &self,
        key: &IdempotencyKey,
        request: SendRequest,
    ) -> Result<SendOutcome, DispatchError> {
        let key = key.as_str();
        let started = Instant::now();
        self.update_status(key, DeliveryStatus::begin);

        self.limiter.acquire().await;
        debug!(key, "Rate limiter admitted send");

        let result = self
            .retry
            .run(|attempt| self.attempt(key, &request, attempt))
            .await;

        match result {
            Ok(outcome) => {
                self.update_status(key, |status| {
                    status.mark_sent(outcome.provider.clone(), Utc::now());
                });
                info!(
                    key,
                    provider = %outcome.provider,
                    message_id = outcome.message_id.as_deref().unwrap_or("-"),
                    "Message sent"
                );
                self.record_send(Some(&outcome.provider), true, started);
                Ok(outcome)
            }
            Err(err) => {
                let provider = err
                    .root_cause()
                    .provider_name()
                    .map(str::to_string)
                    .or_else(|| self.get_status_provider(key));
                self.update_status(key, |status| {
                    status.mark_failed(provider.clone(), err.to_string(), Utc::now());
                });
                error!(key, error = %err, "Message delivery failed");
                self.record_send(provider.as_deref(), false, started);
                Err(err)
            }
        }
    }

    /// One provider invocation against whichever provider is active now.
    async fn attempt(
        &self,
        key: &str,
        request: &SendRequest,
        attempt: u32,
    ) -> Result<SendOutcome, DispatchError> {
        let role = self.pair.active_role();
        let slot = self.pair.slot(role);
        let provider_name = slot.name().to_string();

        self.update_status(key, |status| {
            status.record_provider_attempt(attempt);
            status.provider = Some(provider_name.clone());
        });
        debug!(key, attempt, provider = %provider_name, "Attempting send");

        let result = slot
            .breaker()
            .execute(|| async {
                let outcome = self.timeouts.send(slot.provider().send(request)).await?;
                if outcome.success {
                    Ok(outcome)
                } else {
                    Err(DispatchError::provider(
                        outcome.provider,
                        outcome
                            .error
                            .unwrap_or_else(|| "send rejected".to_string()),
                        true,
                    ))
                }
            })
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_provider_attempt(&provider_name, result.is_ok());
        }

        if let Err(err) = &result {
            warn!(key, attempt, provider = %provider_name, error = %err, "Send attempt failed");
            self.fail_over_if_unhealthy(role).await;
        }
        result
    }

    async fn fail_over_if_unhealthy(&self, role: ProviderRole) {
        let verdict = self.pair.probe(role).await;
        if verdict.is_healthy() {
            debug!(role = %role, "Provider still healthy after failure");
        } else {
            self.pair.switch_from(role);
        }
    }

    fn update_status(&self, key: &str, apply: impl FnOnce(&mut DeliveryStatus)) {
        let mut status = self.statuses.entry(key.to_string()).or_default();
        apply(status.value_mut());
    }

    fn get_status_provider(&self, key: &str) -> Option<String> {
        self.statuses.get(key).and_then(|status| status.provider.clone())
    }

    fn record_send(&self, provider: Option<&str>, success: bool, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_send(provider, success, started.elapsed());
        }
    }
}

#[async_trait]
impl Deliver for Arc<DispatchCore> {
    async fn deliver(&self, request: SendRequest) -> Result<SendOutcome, DispatchError> {
        self.send(request).await
    }
}

/// Resilient dispatcher over a primary/secondary provider pair.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    queue: DeliveryQueue,
}

impl Dispatcher {
    pub(crate) fn from_core(core: DispatchCore, concurrency: usize) -> Self {
        let core = Arc::new(core);
        let deliver: Arc<dyn Deliver> = Arc::new(Arc::clone(&core));
        let queue = match &core.metrics {
            Some(metrics) => DeliveryQueue::with_metrics(deliver, concurrency, Arc::clone(metrics)),
            None => DeliveryQueue::new(deliver, concurrency),
        };
        Self { core, queue }
    }

    /// Send a message.
    ///
    /// Sends sharing an idempotency key are executed at most once at a time,
    /// and a successful result is reused until it expires. Requests without a
    /// key get a derived one that is unique to this call.
    ///
    /// # Errors
    /// Returns `DispatchError::RetriesExhausted` wrapping the last provider
    /// error once every attempt has failed
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, DispatchError> {
        self.core.send(request).await
    }

    /// Delivery status for an idempotency key
    #[must_use]
    pub fn get_status(&self, key: &str) -> Option<DeliveryStatus> {
        self.core.statuses.get(key).map(|status| status.value().clone())
    }

    /// Submit a message through the bounded delivery queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn queue_send(&self, request: SendRequest) -> DeliveryTicket {
        self.queue.add(request)
    }

    /// Current delivery queue occupancy
    #[must_use]
    pub fn get_queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Name of the provider currently receiving sends
    #[must_use]
    pub fn active_provider(&self) -> &str {
        self.core.pair.active().name()
    }

    /// Breaker state and last health verdict of both providers
    #[must_use]
    pub fn provider_snapshot(&self) -> Vec<ProviderSnapshot> {
        self.core.pair.snapshot()
    }

    /// Number of idempotency keys with a status record
    #[must_use]
    pub fn status_count(&self) -> usize {
        self.core.statuses.len()
    }

    /// The idempotency store backing this dispatcher
    #[must_use]
    pub fn idempotency(&self) -> &IdempotencyStore<SendOutcome> {
        &self.core.idempotency
    }

    /// The rate limiter gating sends
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.core.limiter
    }

    /// The provider pair
    #[must_use]
    pub fn providers(&self) -> &ProviderPair {
        &self.core.pair
    }

    /// The metrics collectors, if enabled
    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<DispatchMetrics>> {
        self.core.metrics.as_ref()
    }

    /// The event sink receiving dispatch events
    #[must_use]
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.core.sink
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.core.pair)
            .field("retry", &self.core.retry)
            .field("statuses", &self.core.statuses.len())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DispatcherBuilder;
    use courier_core::{DeliveryState, MemorySink};
    use courier_providers::SimulatedProvider;
    use courier_resilience::RetryConfig;
    use std::time::Duration;

    fn request(key: Option<&str>) -> SendRequest {
        let builder = SendRequest::builder()
            .to("alice@example.com")
            .from("noreply@example.com")
            .subject("Welcome")
            .body("Thanks for signing up");
        let builder = match key {
            Some(key) => builder.idempotency_key(key),
            None => builder,
        };
        builder.build().expect("valid request")
    }

    fn dispatcher(primary: SimulatedProvider, secondary: SimulatedProvider) -> Dispatcher {
        DispatcherBuilder::new(Arc::new(primary), Arc::new(secondary))
            .retry(RetryConfig::new(3, Duration::from_millis(10)))
            .build()
            .expect("valid dispatcher")
    }

    #[tokio::test]
    async fn test_send_records_sent_status() {
        let dispatcher = dispatcher(SimulatedProvider::new("alpha"), SimulatedProvider::new("beta"));

        let outcome = dispatcher.send(request(Some("welcome-1"))).await.expect("sent");
        assert!(outcome.success);
        assert_eq!(outcome.provider, "alpha");

        let status = dispatcher.get_status("welcome-1").expect("status");
        assert_eq!(status.state, DeliveryState::Sent);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.provider_attempts, 1);
        assert_eq!(status.provider.as_deref(), Some("alpha"));
        assert!(status.last_attempt.is_some());
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_derived_keys_are_unique_per_call() {
        let primary = Arc::new(SimulatedProvider::new("alpha"));
        let dispatcher = DispatcherBuilder::new(primary.clone(), Arc::new(SimulatedProvider::new("beta")))
            .build()
            .expect("valid dispatcher");

        dispatcher.send(request(None)).await.expect("sent");
        dispatcher.send(request(None)).await.expect("sent");

        assert_eq!(primary.send_count(), 2);
        assert_eq!(dispatcher.status_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_key_has_no_status() {
        let dispatcher = dispatcher(SimulatedProvider::new("alpha"), SimulatedProvider::new("beta"));
        assert!(dispatcher.get_status("never-sent").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_marks_retrying_then_sent() {
        let primary = Arc::new(SimulatedProvider::new("alpha").failing_first(2));
        let dispatcher = DispatcherBuilder::new(primary.clone(), Arc::new(SimulatedProvider::new("beta")))
            .retry(RetryConfig::new(3, Duration::from_millis(100)))
            .build()
            .expect("valid dispatcher");

        let outcome = dispatcher.send(request(Some("retry-key"))).await.expect("sent");
        assert_eq!(outcome.provider, "alpha");
        assert_eq!(primary.send_count(), 3);

        let status = dispatcher.get_status("retry-key").expect("status");
        assert_eq!(status.state, DeliveryState::Sent);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.provider_attempts, 3);
        assert_eq!(dispatcher.active_provider(), "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_triggers_failover() {
        let sink = MemorySink::new();
        let primary = Arc::new(
            SimulatedProvider::new("alpha")
                .failing_first(1)
                .with_broken_health_check(),
        );
        let dispatcher = DispatcherBuilder::new(primary, Arc::new(SimulatedProvider::new("beta")))
            .retry(RetryConfig::new(3, Duration::from_millis(10)))
            .event_sink(Arc::new(sink.clone()))
            .build()
            .expect("valid dispatcher");

        let outcome = dispatcher.send(request(Some("k"))).await.expect("sent");
        assert_eq!(outcome.provider, "beta");
        assert_eq!(dispatcher.active_provider(), "beta");
        assert_eq!(sink.error_count(), 1);
        assert!(sink.info_messages().contains(&"Switched provider".to_string()));
    }
}
