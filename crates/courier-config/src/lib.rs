//! # Courier Configuration
//!
//! Configuration management for the dispatch layer, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files or inline strings
//! - Environment variable substitution and overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource, Format};
pub use schema::{
    CircuitBreakerSettings, CourierConfig, IdempotencySettings, ObservabilitySettings,
    ProviderSettings, ProvidersConfig, QueueSettings, RateLimitSettings, RetrySettings,
    TimeoutSettings,
};
