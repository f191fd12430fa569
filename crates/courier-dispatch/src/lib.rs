//! # Courier Dispatch
//!
//! The top-level dispatcher, composing:
//! - Idempotent execution keyed per logical send
//! - Sliding-window rate limiting
//! - Retries around a per-provider circuit breaker
//! - Health-triggered failover between two providers
//! - Per-key delivery status and a bounded-concurrency queue

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod dispatcher;
pub mod queue;

pub use builder::{simulated_providers, DispatcherBuilder};
pub use dispatcher::Dispatcher;
pub use queue::{Deliver, DeliveryQueue, DeliveryTicket, QueueStatus};
