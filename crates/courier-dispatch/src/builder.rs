//! Dispatcher construction from code or from a loaded configuration.

use crate::dispatcher::{DispatchCore, Dispatcher};
use courier_config::{CourierConfig, ProviderSettings, ProvidersConfig};
use courier_core::{DispatchError, EventSink, MessageProvider, TracingSink};
use courier_providers::{ProviderPair, SimulatedProvider};
use courier_resilience::{
    CircuitBreakerConfig, IdempotencyConfig, IdempotencyStore, RateLimiter, RetryConfig,
    RetryPolicy, TimeoutConfig, TimeoutManager,
};
use courier_telemetry::{DispatchMetrics, MetricsSink};
use dashmap::DashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::info;

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    primary: Arc<dyn MessageProvider>,
    secondary: Arc<dyn MessageProvider>,
    retry: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    rate_limiter: RateLimiter,
    idempotency: IdempotencyConfig,
    timeouts: TimeoutConfig,
    concurrency: usize,
    sink: Arc<dyn EventSink>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl DispatcherBuilder {
    /// Start a builder with default policies
    #[must_use]
    pub fn new(primary: Arc<dyn MessageProvider>, secondary: Arc<dyn MessageProvider>) -> Self {
        Self {
            primary,
            secondary,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiter::with_defaults(),
            idempotency: IdempotencyConfig::default(),
            timeouts: TimeoutConfig::default(),
            concurrency: 5,
            sink: Arc::new(TracingSink),
            metrics: None,
        }
    }

    /// Start a builder from a loaded configuration.
    ///
    /// Metrics are created when enabled in the configuration.
    ///
    /// # Errors
    /// Returns `DispatchError::Configuration` if the metrics registry cannot be created
    pub fn from_config(
        config: &CourierConfig,
        primary: Arc<dyn MessageProvider>,
        secondary: Arc<dyn MessageProvider>,
    ) -> Result<Self, DispatchError> {
        let mut builder = Self::new(primary, secondary)
            .retry(RetryConfig::from(&config.retry))
            .circuit_breaker(CircuitBreakerConfig::from(&config.circuit_breaker))
            .rate_limiter(config.rate_limit.build())
            .idempotency(IdempotencyConfig::from(&config.idempotency))
            .timeouts(TimeoutConfig::from(&config.timeout))
            .concurrency(config.queue.concurrency);

        if config.observability.metrics.enabled {
            let metrics = DispatchMetrics::new(&config.observability.metrics)
                .map_err(|e| DispatchError::configuration(format!("metrics registry: {e}")))?;
            builder = builder.metrics(Arc::new(metrics));
        }
        Ok(builder)
    }

    /// Set the retry configuration
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the circuit breaker configuration applied to each provider
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set the rate limiter
    #[must_use]
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Set the idempotency configuration
    #[must_use]
    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = config;
        self
    }

    /// Set provider call deadlines
    #[must_use]
    pub fn timeouts(mut self, config: TimeoutConfig) -> Self {
        self.timeouts = config;
        self
    }

    /// Set the delivery queue concurrency
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the event sink
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Record metrics; events are also counted into them
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the dispatcher
    ///
    /// # Errors
    /// Returns `DispatchError::Configuration` if both providers share a name
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let sink: Arc<dyn EventSink> = match &self.metrics {
            Some(metrics) => Arc::new(MetricsSink::new(Arc::clone(metrics), self.sink)),
            None => self.sink,
        };
        let timeouts = TimeoutManager::new(self.timeouts);

        let pair = ProviderPair::with_sink(
            self.primary,
            self.secondary,
            self.circuit_breaker,
            Arc::clone(&sink),
        )?
        .with_timeouts(timeouts.clone());

        info!(
            max_attempts = self.retry.max_attempts,
            concurrency = self.concurrency,
            rate_limited = self.rate_limiter.is_enabled(),
            "Dispatcher built"
        );

        let core = DispatchCore {
            pair,
            retry: RetryPolicy::new(self.retry),
            limiter: self.rate_limiter,
            idempotency: IdempotencyStore::new(self.idempotency),
            timeouts,
            sink,
            metrics: self.metrics,
            statuses: DashMap::new(),
            sequence: AtomicU64::new(0),
        };
        Ok(Dispatcher::from_core(core, self.concurrency))
    }
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Build the simulated providers described by the configuration
#[must_use]
pub fn simulated_providers(
    config: &ProvidersConfig,
) -> (Arc<SimulatedProvider>, Arc<SimulatedProvider>) {
    (
        Arc::new(simulated(&config.primary)),
        Arc::new(simulated(&config.secondary)),
    )
}

fn simulated(settings: &ProviderSettings) -> SimulatedProvider {
    SimulatedProvider::new(&settings.name)
        .with_failure_rate(settings.failure_rate)
        .with_latency(settings.latency)
        .with_health_failure_rate(settings.health_failure_rate)
}
