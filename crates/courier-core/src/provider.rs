//! Provider traits and health types.
//!
//! This module defines the capability every message backend must expose to
//! the dispatcher, along with the health vocabulary used for failover.

use crate::error::DispatchError;
use crate::types::{SendOutcome, SendRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Core trait for all message providers
///
/// Implementations carry the actual wire transport. The dispatcher wraps
/// every call in rate limiting, retries and a circuit breaker, so providers
/// should report failures rather than retry internally.
#[async_trait]
pub trait MessageProvider: Send + Sync + 'static {
    /// Unique provider name used in outcomes, status records and logs
    fn name(&self) -> &str;

    /// Send a single message
    ///
    /// # Errors
    /// Returns `DispatchError::Provider` when the backend rejects or fails the send
    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, DispatchError>;

    /// Perform a health check on this provider
    ///
    /// # Errors
    /// Returns an error when the health probe itself could not be completed
    async fn health_check(&self) -> Result<HealthStatus, DispatchError>;
}

/// What a provider reports about itself when probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Sending normally
    Healthy,
    /// Sending, but slowly or with elevated error rates
    Degraded,
    /// Not sending
    Unhealthy,
    /// No report yet
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Whether a provider reporting this may stay the active one.
    ///
    /// Degraded providers keep traffic; only a clear "no" or silence moves it.
    #[must_use]
    pub fn accepts_traffic(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Lowercase label, as serialized
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a health probe, consumed by the failover decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// The provider reported it can take traffic
    Healthy,
    /// The provider reported it cannot take traffic
    Unhealthy,
    /// The probe could not be completed
    CheckFailed(String),
}

impl HealthCheck {
    /// Fold a probe result into a verdict
    #[must_use]
    pub fn from_probe(result: Result<HealthStatus, DispatchError>) -> Self {
        match result {
            Ok(status) if status.accepts_traffic() => Self::Healthy,
            Ok(_) => Self::Unhealthy,
            Err(err) => Self::CheckFailed(err.to_string()),
        }
    }

    /// Check if the verdict allows the provider to stay active.
    ///
    /// A failed probe counts as unhealthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::CheckFailed(reason) => write!(f, "check failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_keeps_traffic() {
        let keeps: Vec<_> = [
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Unhealthy,
            HealthStatus::Unknown,
        ]
        .into_iter()
        .filter(|s| s.accepts_traffic())
        .map(HealthStatus::as_str)
        .collect();

        assert_eq!(keeps, vec!["healthy", "degraded"]);
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
    }

    #[test]
    fn test_health_check_from_probe() {
        assert_eq!(HealthCheck::from_probe(Ok(HealthStatus::Healthy)), HealthCheck::Healthy);
        assert_eq!(HealthCheck::from_probe(Ok(HealthStatus::Degraded)), HealthCheck::Healthy);
        assert_eq!(HealthCheck::from_probe(Ok(HealthStatus::Unknown)), HealthCheck::Unhealthy);

        let failed = HealthCheck::from_probe(Err(DispatchError::internal("socket closed")));
        assert!(!failed.is_healthy());
        assert!(failed.to_string().contains("socket closed"));
    }

    struct StaticProvider;

    #[async_trait]
    impl MessageProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        async fn send(&self, _: &SendRequest) -> Result<SendOutcome, DispatchError> {
            Ok(SendOutcome::delivered("static", "msg-1"))
        }

        async fn health_check(&self) -> Result<HealthStatus, DispatchError> {
            Ok(HealthStatus::Healthy)
        }
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let provider: std::sync::Arc<dyn MessageProvider> = std::sync::Arc::new(StaticProvider);
        let request = SendRequest::builder()
            .to("a@example.com")
            .from("b@example.com")
            .build()
            .expect("valid request");

        let outcome = provider.send(&request).await.expect("send");
        assert!(outcome.success);
        assert_eq!(outcome.provider, "static");
        assert_eq!(provider.health_check().await, Ok(HealthStatus::Healthy));
    }
}
