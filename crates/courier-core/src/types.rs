//! Message request and outcome types.
//!
//! A [`SendRequest`] is immutable once built. Its optional
//! [`IdempotencyKey`] decides which concurrent and repeated submissions are
//! treated as the same logical send.

use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of body characters folded into a derived idempotency key
pub const DERIVED_KEY_BODY_PREFIX: usize = 20;

/// Idempotency key identifying one logical send
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum length for a caller-supplied key
    pub const MAX_LENGTH: usize = 256;

    /// Create a new idempotency key with validation
    ///
    /// # Errors
    /// Returns `DispatchError::Validation` if empty or exceeds max length
    pub fn new(value: impl Into<String>) -> Result<Self, DispatchError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DispatchError::validation(
                "idempotency_key",
                "idempotency key cannot be empty",
            ));
        }
        if value.len() > Self::MAX_LENGTH {
            return Err(DispatchError::validation(
                "idempotency_key",
                format!("idempotency key exceeds maximum length of {}", Self::MAX_LENGTH),
            ));
        }
        Ok(Self(value))
    }

    /// Get the inner value as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for IdempotencyKey {
    type Error = DispatchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message to dispatch through a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient address
    pub to: String,
    /// Sender address
    pub from: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Optional rich (HTML) body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Caller-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SendRequest {
    /// Create a new request builder
    #[must_use]
    pub fn builder() -> SendRequestBuilder {
        SendRequestBuilder::default()
    }

    /// Derive an idempotency key from the request content.
    ///
    /// The key folds in the recipient, subject, the first
    /// [`DERIVED_KEY_BODY_PREFIX`] characters of the body, the submission
    /// time in milliseconds and a caller-provided sequence number. It is unique
    /// per submission and therefore never deduplicates two separate calls.
    #[must_use]
    pub fn derive_idempotency_key(&self, submitted_at: DateTime<Utc>, sequence: u64) -> IdempotencyKey {
        let prefix: String = self.body.chars().take(DERIVED_KEY_BODY_PREFIX).collect();
        IdempotencyKey(format!(
            "{}-{}-{}-{}-{}",
            self.to,
            self.subject,
            prefix,
            submitted_at.timestamp_millis(),
            sequence
        ))
    }
}

/// Builder for `SendRequest`
#[derive(Debug, Default)]
pub struct SendRequestBuilder {
    to: Option<String>,
    from: Option<String>,
    subject: Option<String>,
    body: Option<String>,
    html: Option<String>,
    idempotency_key: Option<String>,
}

impl SendRequestBuilder {
    /// Set the recipient
    #[must_use]
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Set the sender
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the subject
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the plain-text body
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the rich body
    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Set the idempotency key
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Build the request
    ///
    /// # Errors
    /// Returns `DispatchError::Validation` if the recipient or sender is
    /// missing, or the idempotency key is invalid
    pub fn build(self) -> Result<SendRequest, DispatchError> {
        let to = self
            .to
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| DispatchError::validation("to", "recipient is required"))?;
        let from = self
            .from
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| DispatchError::validation("from", "sender is required"))?;
        let idempotency_key = self.idempotency_key.map(IdempotencyKey::new).transpose()?;

        Ok(SendRequest {
            to,
            from,
            subject: self.subject.unwrap_or_default(),
            body: self.body.unwrap_or_default(),
            html: self.html,
            idempotency_key,
        })
    }
}

/// Result of a send as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    /// Whether the provider accepted the message
    pub success: bool,
    /// Name of the provider that handled the send
    pub provider: String,
    /// Backend message identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Error detail reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    /// Create a successful outcome
    #[must_use]
    pub fn delivered(provider: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider: provider.into(),
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    /// Create a failed outcome
    #[must_use]
    pub fn rejected(provider: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider: provider.into(),
            message_id: None,
            error: Some(error.into()),
        }
    }
}
