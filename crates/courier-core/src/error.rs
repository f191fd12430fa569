//! Error types for message dispatch.
//!
//! Every failure the dispatch pipeline can surface to a caller is a variant of
//! [`DispatchError`]. The type is `Clone` because a single in-flight send may
//! be observed by several coalesced callers, each of which receives its own
//! copy of the terminal outcome.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using `DispatchError`
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors produced while dispatching a message
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// The backend provider rejected or failed the send
    #[error("Provider error: {provider} - {message}")]
    Provider {
        /// Provider that returned the error
        provider: String,
        /// Error message
        message: String,
        /// Whether this error is worth retrying
        retryable: bool,
    },

    /// The circuit breaker short-circuited the call without invoking the provider
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitOpen {
        /// Provider guarded by the open breaker
        provider: String,
    },

    /// Every retry attempt failed
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last: Box<DispatchError>,
    },

    /// A bounded rate-limiter wait expired before admission
    #[error("Rate limiter admission timed out after {waited:?}")]
    RateLimitTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// A non-blocking admission was refused
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until a slot frees up in the window
        retry_after: Duration,
    },

    /// An operation exceeded its deadline
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Deadline that was exceeded
        duration: Duration,
    },

    /// The request is malformed
    #[error("Validation error on {field}: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// Error message
        message: String,
    },

    /// The delivery queue went away before the request completed
    #[error("Delivery queue closed before the request completed")]
    QueueClosed,

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl DispatchError {
    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::CircuitOpen { .. }
            | Self::RateLimitTimeout { .. }
            | Self::RateLimited { .. }
            | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Provider { .. } => "provider_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::RateLimitTimeout { .. } => "rate_limit_timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Validation { .. } => "validation_error",
            Self::QueueClosed => "queue_closed",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Name of the provider this error is attributed to, if any
    #[must_use]
    pub fn provider_name(&self) -> Option<&str> {
        match self {
            Self::Provider { provider, .. } | Self::CircuitOpen { provider } => Some(provider),
            Self::RetriesExhausted { last, .. } => last.provider_name(),
            _ => None,
        }
    }

    /// The innermost error, unwrapping any `RetriesExhausted` layers
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// Create a provider error
    #[must_use]
    pub fn provider(provider: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Create a circuit open error
    #[must_use]
    pub fn circuit_open(provider: impl Into<String>) -> Self {
        Self::CircuitOpen {
            provider: provider.into(),
        }
    }

    /// Create a retries exhausted error wrapping the last failure
    #[must_use]
    pub fn retries_exhausted(attempts: u32, last: Self) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }

    /// Create a rate limit timeout error
    #[must_use]
    pub fn rate_limit_timeout(waited: Duration) -> Self {
        Self::RateLimitTimeout { waited }
    }

    /// Create a rate limited error
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryability() {
        assert!(DispatchError::provider("smtp", "boom", true).is_retryable());
        assert!(!DispatchError::provider("smtp", "bad address", false).is_retryable());
        assert!(DispatchError::circuit_open("smtp").is_retryable());
        assert!(DispatchError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(!DispatchError::validation("to", "empty").is_retryable());
        assert!(!DispatchError::QueueClosed.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DispatchError::circuit_open("a").error_code(), "circuit_open");
        assert_eq!(
            DispatchError::retries_exhausted(3, DispatchError::internal("x")).error_code(),
            "retries_exhausted"
        );
        assert_eq!(DispatchError::QueueClosed.error_code(), "queue_closed");
    }

    #[test]
    fn test_retries_exhausted_wraps_last_error() {
        let last = DispatchError::provider("primary", "connection reset", true);
        let err = DispatchError::retries_exhausted(3, last.clone());

        assert_eq!(err.root_cause(), &last);
        assert_eq!(err.provider_name(), Some("primary"));
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;

        let err = DispatchError::retries_exhausted(2, DispatchError::circuit_open("backup"));
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Circuit breaker open for provider: backup"));
    }
}
