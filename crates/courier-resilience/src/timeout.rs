//! Deadlines for provider calls.
//!
//! Sends and health probes get separate deadlines so that a slow probe never
//! holds up failover for as long as a slow send would.

use courier_core::DispatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Provider call categories with their own deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `MessageProvider::send`
    Send,
    /// `MessageProvider::health_check`
    HealthCheck,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::HealthCheck => "health_check",
        })
    }
}

/// Per-call deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for a single provider send
    #[serde(with = "humantime_serde")]
    pub send: Duration,
    /// Deadline for a provider health probe
    #[serde(with = "humantime_serde")]
    pub health_check: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            send: Duration::from_secs(30),
            health_check: Duration::from_secs(5),
        }
    }
}

/// Applies [`TimeoutConfig`] deadlines to provider futures
#[derive(Debug, Clone, Default)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Wrap a deadline configuration
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// 30 s sends, 5 s probes
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Deadline applied to `kind`
    #[must_use]
    pub fn limit(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Send => self.config.send,
            CallKind::HealthCheck => self.config.health_check,
        }
    }

    /// Run `call` under the deadline for `kind`.
    ///
    /// The inner result is passed through untouched when the call finishes
    /// in time; the future is dropped when it does not.
    ///
    /// # Errors
    /// Returns `DispatchError::Timeout` carrying the deadline that elapsed
    pub async fn run<F, T>(&self, kind: CallKind, call: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>>,
    {
        let limit = self.limit(kind);
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    call = %kind,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Provider call exceeded its deadline"
                );
                Err(DispatchError::timeout(limit))
            }
        }
    }

    /// Shorthand for [`CallKind::Send`]
    ///
    /// # Errors
    /// See [`TimeoutManager::run`]
    pub async fn send<F, T>(&self, call: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>>,
    {
        self.run(CallKind::Send, call).await
    }

    /// Shorthand for [`CallKind::HealthCheck`]
    ///
    /// # Errors
    /// See [`TimeoutManager::run`]
    pub async fn health_check<F, T>(&self, call: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>>,
    {
        self.run(CallKind::HealthCheck, call).await
    }
}
