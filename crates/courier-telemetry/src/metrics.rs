//! Prometheus metrics for the dispatcher.
//!
//! Provides metrics for:
//! - Logical sends by provider and outcome, with latency
//! - Individual provider attempts
//! - Failover switches, breaker openings and failed health probes
//! - Idempotency cache hits and queue occupancy

use courier_core::{DispatchError, EventContext, EventSink};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
    /// Namespace prefixed to every metric name
    pub namespace: String,
    /// Histogram buckets for send latency, in seconds
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "courier".to_string(),
            latency_buckets: vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        }
    }
}

/// Prometheus collectors for the dispatch layer
pub struct DispatchMetrics {
    registry: Registry,
    sends_total: CounterVec,
    send_duration: HistogramVec,
    provider_attempts: CounterVec,
    provider_switches: CounterVec,
    circuit_opened: CounterVec,
    health_check_failures: CounterVec,
    idempotency_hits: CounterVec,
    queue_items: GaugeVec,
}

impl DispatchMetrics {
    /// Create and register all collectors
    ///
    /// # Errors
    /// Returns error if a collector cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let ns = config.namespace.as_str();

        let sends_total = CounterVec::new(
            Opts::new("sends_total", "Logical sends by provider and outcome").namespace(ns),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(sends_total.clone()))?;

        let send_duration = HistogramVec::new(
            HistogramOpts::new("send_duration_seconds", "End-to-end send latency in seconds")
                .namespace(ns)
                .buckets(config.latency_buckets.clone()),
            &["outcome"],
        )?;
        registry.register(Box::new(send_duration.clone()))?;

        let provider_attempts = CounterVec::new(
            Opts::new("provider_attempts_total", "Provider invocations by result").namespace(ns),
            &["provider", "result"],
        )?;
        registry.register(Box::new(provider_attempts.clone()))?;

        let provider_switches = CounterVec::new(
            Opts::new("provider_switches_total", "Failover switches by new active provider")
                .namespace(ns),
            &["provider"],
        )?;
        registry.register(Box::new(provider_switches.clone()))?;

        let circuit_opened = CounterVec::new(
            Opts::new("circuit_opened_total", "Circuit breaker transitions to open").namespace(ns),
            &["provider"],
        )?;
        registry.register(Box::new(circuit_opened.clone()))?;

        let health_check_failures = CounterVec::new(
            Opts::new("health_check_failures_total", "Health probes that could not complete")
                .namespace(ns),
            &["provider"],
        )?;
        registry.register(Box::new(health_check_failures.clone()))?;

        let idempotency_hits = CounterVec::new(
            Opts::new("idempotency_lookups_total", "Idempotency store lookups by result")
                .namespace(ns),
            &["result"],
        )?;
        registry.register(Box::new(idempotency_hits.clone()))?;

        let queue_items = GaugeVec::new(
            Opts::new("queue_items", "Delivery queue occupancy").namespace(ns),
            &["state"],
        )?;
        registry.register(Box::new(queue_items.clone()))?;

        info!(namespace = ns, "Dispatch metrics initialized");

        Ok(Self {
            registry,
            sends_total,
            send_duration,
            provider_attempts,
            provider_switches,
            circuit_opened,
            health_check_failures,
            idempotency_hits,
            queue_items,
        })
    }

    /// Create with default configuration
    ///
    /// # Errors
    /// Returns error if a collector cannot be registered
    pub fn with_defaults() -> Result<Self, prometheus::Error> {
        Self::new(&MetricsConfig::default())
    }

    /// Record a finished logical send
    pub fn record_send(&self, provider: Option<&str>, success: bool, latency: Duration) {
        let outcome = if success { "sent" } else { "failed" };
        let provider = provider.unwrap_or("none");
        self.sends_total.with_label_values(&[provider, outcome]).inc();
        self.send_duration
            .with_label_values(&[outcome])
            .observe(latency.as_secs_f64());
        debug!(
            provider,
            outcome,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            "Send metrics recorded"
        );
    }

    /// Record one provider invocation
    pub fn record_provider_attempt(&self, provider: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.provider_attempts
            .with_label_values(&[provider, result])
            .inc();
    }

    /// Record a failover to `provider`
    pub fn record_switch(&self, provider: &str) {
        self.provider_switches.with_label_values(&[provider]).inc();
    }

    /// Record a breaker opening for `provider`
    pub fn record_circuit_opened(&self, provider: &str) {
        self.circuit_opened.with_label_values(&[provider]).inc();
    }

    /// Record a health probe that could not complete
    pub fn record_health_check_failure(&self, provider: &str) {
        self.health_check_failures
            .with_label_values(&[provider])
            .inc();
    }

    /// Record whether a send was answered from the idempotency cache
    pub fn record_idempotency_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.idempotency_hits.with_label_values(&[result]).inc();
    }

    /// Update queue occupancy gauges
    pub fn set_queue_depth(&self, pending: usize, active: usize) {
        self.queue_items
            .with_label_values(&["pending"])
            .set(pending as f64);
        self.queue_items
            .with_label_values(&["active"])
            .set(active as f64);
    }

    /// Get metrics in Prometheus text format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for DispatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchMetrics").finish_non_exhaustive()
    }
}

/// Event sink that counts dispatch events before forwarding them
pub struct MetricsSink {
    metrics: Arc<DispatchMetrics>,
    inner: Arc<dyn EventSink>,
}

impl MetricsSink {
    /// Wrap `inner`, counting events into `metrics`
    #[must_use]
    pub fn new(metrics: Arc<DispatchMetrics>, inner: Arc<dyn EventSink>) -> Self {
        Self { metrics, inner }
    }
}

impl EventSink for MetricsSink {
    fn info(&self, message: &str, context: &EventContext) {
        let provider = context.provider.as_deref().unwrap_or("unknown");
        match context.field("event") {
            Some("provider_switched") => self.metrics.record_switch(provider),
            Some("circuit_opened") => self.metrics.record_circuit_opened(provider),
            _ => {}
        }
        self.inner.info(message, context);
    }

    fn error(&self, err: &DispatchError, context: &EventContext) {
        if context.field("event") == Some("health_check_failed") {
            let provider = context.provider.as_deref().unwrap_or("unknown");
            self.metrics.record_health_check_failure(provider);
        }
        self.inner.error(err, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MemorySink;

    fn metrics() -> Arc<DispatchMetrics> {
        Arc::new(DispatchMetrics::with_defaults().expect("metrics"))
    }

    #[test]
    fn test_record_send() {
        let metrics = metrics();
        metrics.record_send(Some("alpha"), true, Duration::from_millis(120));
        metrics.record_send(None, false, Duration::from_secs(3));

        let output = metrics.gather();
        assert!(output.contains("courier_sends_total"));
        assert!(output.contains(r#"provider="alpha""#));
        assert!(output.contains(r#"provider="none""#));
        assert!(output.contains("courier_send_duration_seconds"));
    }

    #[test]
    fn test_custom_namespace() {
        let config = MetricsConfig {
            namespace: "mailer".to_string(),
            ..MetricsConfig::default()
        };
        let metrics = DispatchMetrics::new(&config).expect("metrics");
        metrics.record_idempotency_lookup(true);
        assert!(metrics.gather().contains("mailer_idempotency_lookups_total"));
    }

    #[test]
    fn test_queue_gauges() {
        let metrics = metrics();
        metrics.set_queue_depth(7, 5);
        let output = metrics.gather();
        assert!(output.contains(r#"courier_queue_items{state="pending"} 7"#));
        assert!(output.contains(r#"courier_queue_items{state="active"} 5"#));
    }

    #[test]
    fn test_sink_counts_and_forwards() {
        let metrics = metrics();
        let memory = MemorySink::new();
        let sink = MetricsSink::new(Arc::clone(&metrics), Arc::new(memory.clone()));

        sink.info(
            "Switched provider",
            &EventContext::new()
                .with_provider("beta")
                .with_field("event", "provider_switched"),
        );
        sink.info(
            "Circuit breaker opened",
            &EventContext::new()
                .with_provider("alpha")
                .with_field("event", "circuit_opened"),
        );
        sink.error(
            &DispatchError::internal("probe crashed"),
            &EventContext::new()
                .with_provider("alpha")
                .with_field("event", "health_check_failed"),
        );

        assert_eq!(memory.events().len(), 3);
        let output = metrics.gather();
        assert!(output.contains(r#"courier_provider_switches_total{provider="beta"} 1"#));
        assert!(output.contains(r#"courier_circuit_opened_total{provider="alpha"} 1"#));
        assert!(output.contains(r#"courier_health_check_failures_total{provider="alpha"} 1"#));
    }
}
