//! # Courier Resilience
//!
//! Resilience policies composed by the dispatcher:
//! - Retry policy with exponential backoff
//! - Circuit breaker for failing providers
//! - Sliding-window rate limiting with FIFO admission
//! - Idempotent execution with in-flight coalescing
//! - Deadlines for provider calls

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod idempotency;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use idempotency::{IdempotencyConfig, IdempotencyStats, IdempotencyStore};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{retry_with_backoff, RetryConfig, RetryPolicy};
pub use timeout::{CallKind, TimeoutConfig, TimeoutManager};
