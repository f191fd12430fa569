//! Per-key delivery status records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a logical send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Submitted, not yet attempted or currently on its first attempt
    #[default]
    Pending,
    /// A retry iteration is in progress
    Retrying,
    /// Delivered successfully
    Sent,
    /// All attempts failed
    Failed,
}

impl DeliveryState {
    /// Check if the state is terminal for the current logical send
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of all sends made under one idempotency key.
///
/// `attempts` counts logical sends that reached a terminal outcome, while
/// `provider_attempts` counts every provider invocation including retries.
/// Both only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeliveryStatus {
    /// Current state
    pub state: DeliveryState,
    /// Number of logical sends completed under this key
    pub attempts: u32,
    /// Number of provider invocations made under this key
    pub provider_attempts: u32,
    /// When the last logical send finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Provider that produced the latest outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Error detail of the latest failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryStatus {
    /// Create a fresh pending status
    #[must_use]
    pub fn pending() -> Self {
        Self::default()
    }

    /// Mark a new logical send as started
    pub fn begin(&mut self) {
        self.state = DeliveryState::Pending;
    }

    /// Record a provider invocation
    pub fn record_provider_attempt(&mut self, attempt: u32) {
        if attempt > 1 {
            self.state = DeliveryState::Retrying;
        }
        self.provider_attempts = self.provider_attempts.saturating_add(1);
    }

    /// Record a successful logical send
    pub fn mark_sent(&mut self, provider: impl Into<String>, at: DateTime<Utc>) {
        self.state = DeliveryState::Sent;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(at);
        self.provider = Some(provider.into());
        self.error = None;
    }

    /// Record a failed logical send
    pub fn mark_failed(&mut self, provider: Option<String>, error: impl Into<String>, at: DateTime<Utc>) {
        self.state = DeliveryState::Failed;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(at);
        if provider.is_some() {
            self.provider = provider;
        }
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(DeliveryState::Pending.to_string(), "pending");
        assert_eq!(DeliveryState::Retrying.to_string(), "retrying");
        assert!(DeliveryState::Sent.is_terminal());
        assert!(!DeliveryState::Retrying.is_terminal());
    }

    #[test]
    fn test_status_lifecycle() {
        let mut status = DeliveryStatus::pending();
        assert_eq!(status.state, DeliveryState::Pending);
        assert_eq!(status.attempts, 0);

        status.record_provider_attempt(1);
        assert_eq!(status.state, DeliveryState::Pending);
        status.record_provider_attempt(2);
        assert_eq!(status.state, DeliveryState::Retrying);

        status.mark_sent("primary", Utc::now());
        assert_eq!(status.state, DeliveryState::Sent);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.provider_attempts, 2);
        assert_eq!(status.provider.as_deref(), Some("primary"));
        assert!(status.last_attempt.is_some());
    }

    #[test]
    fn test_failure_keeps_counts_growing() {
        let mut status = DeliveryStatus::pending();
        status.mark_failed(None, "boom", Utc::now());
        status.begin();
        status.mark_failed(Some("backup".to_string()), "boom again", Utc::now());

        assert_eq!(status.attempts, 2);
        assert_eq!(status.state, DeliveryState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom again"));
        assert_eq!(status.provider.as_deref(), Some("backup"));
    }

    #[test]
    fn test_status_serialization() {
        let status = DeliveryStatus::pending();
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["state"], "pending");
        assert!(json.get("error").is_none());
    }
}
