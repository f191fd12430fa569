//! # Courier Providers
//!
//! Provider management for the dispatcher:
//! - Primary/secondary pair with a circuit breaker per provider
//! - Health probing and failover
//! - Simulated provider for demos and tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pair;
pub mod simulated;

pub use pair::{CachedHealth, ProviderPair, ProviderRole, ProviderSlot, ProviderSnapshot};
pub use simulated::SimulatedProvider;
