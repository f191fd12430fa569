//! Configuration schema definitions.
//!
//! Every section has defaults, so an empty document is a valid configuration.
//! Durations use humantime notation ("500ms", "30s", "1h").

use courier_resilience::{
    CircuitBreakerConfig, IdempotencyConfig, RateLimiter, RateLimiterConfig, RetryConfig,
    TimeoutConfig,
};
use courier_telemetry::{LoggingConfig, MetricsConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main dispatcher configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CourierConfig {
    /// Primary and secondary provider settings
    #[validate(nested)]
    pub providers: ProvidersConfig,

    /// Retry settings
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Circuit breaker settings, applied to each provider
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Rate limiter settings
    #[validate(nested)]
    pub rate_limit: RateLimitSettings,

    /// Idempotency store settings
    #[validate(nested)]
    pub idempotency: IdempotencySettings,

    /// Delivery queue settings
    #[validate(nested)]
    pub queue: QueueSettings,

    /// Provider call deadlines
    #[validate(nested)]
    pub timeout: TimeoutSettings,

    /// Logging and metrics
    pub observability: ObservabilitySettings,
}

impl CourierConfig {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()
    }
}

/// The two providers wired into the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "distinct_provider_names"))]
pub struct ProvidersConfig {
    /// Provider active at startup
    #[validate(nested)]
    pub primary: ProviderSettings,

    /// Failover target
    #[validate(nested)]
    pub secondary: ProviderSettings,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: ProviderSettings::named("primary"),
            secondary: ProviderSettings::named("secondary"),
        }
    }
}

fn distinct_provider_names(providers: &ProvidersConfig) -> Result<(), ValidationError> {
    if providers.primary.name == providers.secondary.name {
        let mut err = ValidationError::new("duplicate_provider");
        err.message = Some("primary and secondary providers must have distinct names".into());
        return Err(err);
    }
    Ok(())
}

/// Settings for one provider.
///
/// The behaviour knobs only apply to simulated providers; real transports
/// use the name alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderSettings {
    /// Unique provider name
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    /// Probability that a simulated send fails
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_rate: f64,

    /// Simulated latency of each call
    #[serde(with = "humantime_serde")]
    pub latency: Duration,

    /// Probability that a simulated health probe reports unhealthy
    #[validate(range(min = 0.0, max = 1.0))]
    pub health_failure_rate: f64,
}

impl ProviderSettings {
    /// Settings for a provider that always succeeds
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: "provider".to_string(),
            failure_rate: 0.0,
            latency: Duration::ZERO,
            health_failure_rate: 0.0,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "ordered_retry_delays"))]
pub struct RetrySettings {
    /// Maximum attempts per logical send, including the first
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Optional upper bound for any single delay; unset means no ceiling
    #[serde(default, with = "humantime_serde")]
    pub max_delay: Option<Duration>,

    /// Jitter fraction (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            jitter: defaults.jitter,
        }
    }
}

fn ordered_retry_delays(retry: &RetrySettings) -> Result<(), ValidationError> {
    if retry.max_delay.is_some_and(|max| max < retry.initial_delay) {
        let mut err = ValidationError::new("max_delay");
        err.message = Some("max_delay must not be shorter than initial_delay".into());
        return Err(err);
    }
    Ok(())
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        let mut config = RetryConfig::new(settings.max_attempts, settings.initial_delay)
            .with_jitter(settings.jitter);
        config.max_delay = settings.max_delay;
        config
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the breaker
    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is allowed
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout: defaults.recovery_timeout,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout,
        }
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether admissions are limited at all
    pub enabled: bool,

    /// Admissions allowed per interval
    #[validate(range(min = 1, max = 1000000))]
    pub max_requests: u32,

    /// Length of the rolling window
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            enabled: true,
            max_requests: defaults.max_requests,
            interval: defaults.interval,
        }
    }
}

impl RateLimitSettings {
    /// Build the limiter these settings describe
    #[must_use]
    pub fn build(&self) -> RateLimiter {
        if self.enabled {
            RateLimiter::new(RateLimiterConfig::new(self.max_requests, self.interval))
        } else {
            RateLimiter::disabled()
        }
    }
}

/// Idempotency store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    /// How long a successful result is reused
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub ttl: Duration,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl: IdempotencyConfig::default().ttl,
        }
    }
}

impl From<&IdempotencySettings> for IdempotencyConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self { ttl: settings.ttl }
    }
}

/// Delivery queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum sends in flight from the queue
    #[validate(range(min = 1, max = 1024))]
    pub concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

/// Provider call deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Deadline for a single provider send
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub send: Duration,

    /// Deadline for a health probe
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub health_check: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            send: defaults.send,
            health_check: defaults.health_check,
        }
    }
}

impl From<&TimeoutSettings> for TimeoutConfig {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            send: settings.send,
            health_check: settings.health_check,
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

fn non_zero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}
