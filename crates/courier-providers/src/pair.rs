//! Primary/secondary provider pair with health-triggered failover.
//!
//! The pair provides:
//! - A circuit breaker per provider
//! - The active provider index, swapped on an unhealthy verdict
//! - Health probing under a deadline, with the last verdict cached

use chrono::{DateTime, Utc};
use courier_core::{
    DispatchError, EventContext, EventSink, HealthCheck, MessageProvider, TracingSink,
};
use courier_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, TimeoutManager};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Position of a provider within the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    /// Provider active at startup
    Primary,
    /// Failover target
    Secondary,
}

impl ProviderRole {
    fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }

    fn from_index(index: usize) -> Self {
        if index == 0 {
            Self::Primary
        } else {
            Self::Secondary
        }
    }

    /// The other role
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Last health verdict recorded for a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHealth {
    /// Verdict of the probe
    pub verdict: HealthCheck,
    /// When the probe finished
    pub checked_at: DateTime<Utc>,
}

/// A provider together with its circuit breaker
pub struct ProviderSlot {
    provider: Arc<dyn MessageProvider>,
    breaker: CircuitBreaker,
    last_health: RwLock<Option<CachedHealth>>,
}

impl ProviderSlot {
    fn new(provider: Arc<dyn MessageProvider>, config: CircuitBreakerConfig, sink: Arc<dyn EventSink>) -> Self {
        let breaker = CircuitBreaker::new(provider.name(), config).with_sink(sink);
        Self {
            provider,
            breaker,
            last_health: RwLock::new(None),
        }
    }

    /// Provider name
    #[must_use]
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    /// The provider
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MessageProvider> {
        &self.provider
    }

    /// The provider's circuit breaker
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Last recorded health verdict
    #[must_use]
    pub fn last_health(&self) -> Option<CachedHealth> {
        self.last_health.read().clone()
    }
}

/// Point-in-time view of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSnapshot {
    /// Provider name
    pub name: String,
    /// Role within the pair
    pub role: ProviderRole,
    /// Whether sends currently go to this provider
    pub active: bool,
    /// Circuit breaker state
    pub circuit: CircuitState,
    /// Last recorded health verdict
    pub last_health: Option<HealthCheck>,
}

/// Exactly two providers, one of which is active
pub struct ProviderPair {
    slots: [ProviderSlot; 2],
    active: AtomicUsize,
    timeouts: TimeoutManager,
    sink: Arc<dyn EventSink>,
}

impl ProviderPair {
    /// Create a pair with the primary active
    ///
    /// # Errors
    /// Returns `DispatchError::Configuration` if both providers share a name
    pub fn new(
        primary: Arc<dyn MessageProvider>,
        secondary: Arc<dyn MessageProvider>,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, DispatchError> {
        Self::with_sink(primary, secondary, breaker_config, Arc::new(TracingSink))
    }

    /// Create a pair reporting events to `sink`
    ///
    /// # Errors
    /// Returns `DispatchError::Configuration` if both providers share a name
    pub fn with_sink(
        primary: Arc<dyn MessageProvider>,
        secondary: Arc<dyn MessageProvider>,
        breaker_config: CircuitBreakerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, DispatchError> {
        if primary.name() == secondary.name() {
            return Err(DispatchError::configuration(format!(
                "Primary and secondary providers must have distinct names: {}",
                primary.name()
            )));
        }

        info!(
            primary = %primary.name(),
            secondary = %secondary.name(),
            "Provider pair configured"
        );

        Ok(Self {
            slots: [
                ProviderSlot::new(primary, breaker_config.clone(), Arc::clone(&sink)),
                ProviderSlot::new(secondary, breaker_config, Arc::clone(&sink)),
            ],
            active: AtomicUsize::new(0),
            timeouts: TimeoutManager::with_defaults(),
            sink,
        })
    }

    /// Use the given deadlines for health probes
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutManager) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Role of the active provider
    #[must_use]
    pub fn active_role(&self) -> ProviderRole {
        ProviderRole::from_index(self.active.load(Ordering::SeqCst))
    }

    /// The active provider slot
    #[must_use]
    pub fn active(&self) -> &ProviderSlot {
        self.slot(self.active_role())
    }

    /// The slot in the given role
    #[must_use]
    pub fn slot(&self, role: ProviderRole) -> &ProviderSlot {
        &self.slots[role.index()]
    }

    /// Find a slot by provider name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ProviderSlot> {
        self.slots.iter().find(|slot| slot.name() == name)
    }

    /// Probe the health of the provider in `role`.
    ///
    /// Probe errors and timeouts never propagate; they yield
    /// `HealthCheck::CheckFailed` and are reported to the event sink.
    pub async fn probe(&self, role: ProviderRole) -> HealthCheck {
        let slot = self.slot(role);
        let result = self
            .timeouts
            .health_check(slot.provider.health_check())
            .await;

        if let Err(err) = &result {
            warn!(provider = %slot.name(), error = %err, "Provider health check failed");
            self.sink.error(
                err,
                &EventContext::new()
                    .with_provider(slot.name())
                    .with_field("event", "health_check_failed"),
            );
        }

        let verdict = HealthCheck::from_probe(result);
        debug!(provider = %slot.name(), verdict = %verdict, "Provider health probed");
        *slot.last_health.write() = Some(CachedHealth {
            verdict: verdict.clone(),
            checked_at: Utc::now(),
        });
        verdict
    }

    /// Make the other provider active, but only if `observed` is still active.
    ///
    /// Concurrent failures observed on the same provider switch once. Returns
    /// whether this call performed the switch.
    pub fn switch_from(&self, observed: ProviderRole) -> bool {
        let from = observed.index();
        let to = observed.other().index();
        if self
            .active
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(observed = %observed, "Provider already switched");
            return false;
        }

        let old = &self.slots[from];
        let new = &self.slots[to];
        warn!(from = %old.name(), to = %new.name(), "Switched active provider");
        self.sink.info(
            "Switched provider",
            &EventContext::new()
                .with_provider(new.name())
                .with_field("event", "provider_switched")
                .with_field("previous_provider", old.name())
                .with_field("role", observed.other()),
        );
        true
    }

    /// Point-in-time view of both providers
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        let active = self.active_role();
        [ProviderRole::Primary, ProviderRole::Secondary]
            .into_iter()
            .map(|role| {
                let slot = self.slot(role);
                ProviderSnapshot {
                    name: slot.name().to_string(),
                    role,
                    active: role == active,
                    circuit: slot.breaker.state(),
                    last_health: slot.last_health().map(|h| h.verdict),
                }
            })
            .collect()
    }
}

impl fmt::Debug for ProviderPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderPair")
            .field("primary", &self.slots[0].name())
            .field("secondary", &self.slots[1].name())
            .field("active", &self.active_role())
            .finish_non_exhaustive()
    }
}
