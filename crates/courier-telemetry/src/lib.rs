//! # Courier Telemetry
//!
//! Observability for the dispatch layer:
//! - Structured logging initialisation
//! - Prometheus metrics for sends, failover and breaker transitions
//! - An event sink that feeds those metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError, SpanEvents};
pub use metrics::{DispatchMetrics, MetricsConfig, MetricsSink};
