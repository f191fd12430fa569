//! Observability sink for dispatch events.
//!
//! The dispatcher and circuit breakers report notable transitions through an
//! [`EventSink`]:
//! - provider switches
//! - circuit-open transitions
//! - failed health checks
//!
//! [`TracingSink`] forwards events to `tracing`. [`MemorySink`] keeps them in
//! memory for inspection.

use crate::error::DispatchError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Key/value context attached to an event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Idempotency key of the send, if any
    pub idempotency_key: Option<String>,
    /// Provider involved, if any
    pub provider: Option<String>,
    /// Additional fields
    pub fields: BTreeMap<String, String>,
}

impl EventContext {
    /// Create an empty event context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idempotency key
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the provider
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Add a custom field
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    /// Look up a custom field
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn render_fields(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Receiver of structured dispatch events
pub trait EventSink: Send + Sync + 'static {
    /// Record an informational event
    fn info(&self, message: &str, context: &EventContext);

    /// Record an error event
    fn error(&self, error: &DispatchError, context: &EventContext);
}

/// Sink that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn info(&self, message: &str, context: &EventContext) {
        info!(
            idempotency_key = context.idempotency_key.as_deref().unwrap_or("-"),
            provider = context.provider.as_deref().unwrap_or("-"),
            fields = %context.render_fields(),
            "{message}"
        );
    }

    fn error(&self, err: &DispatchError, context: &EventContext) {
        error!(
            idempotency_key = context.idempotency_key.as_deref().unwrap_or("-"),
            provider = context.provider.as_deref().unwrap_or("-"),
            code = err.error_code(),
            fields = %context.render_fields(),
            "{err}"
        );
    }
}

/// An event captured by [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    /// Informational event
    Info {
        /// Event message
        message: String,
        /// Event context
        context: EventContext,
    },
    /// Error event
    Error {
        /// The reported error
        error: DispatchError,
        /// Event context
        context: EventContext,
    },
}

/// Sink that keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemorySink {
    /// Create an empty memory sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Messages of all recorded informational events
    #[must_use]
    pub fn info_messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Info { message, .. } => Some(message.clone()),
                RecordedEvent::Error { .. } => None,
            })
            .collect()
    }

    /// Number of recorded error events
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::Error { .. }))
            .count()
    }

    /// Drop all recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn info(&self, message: &str, context: &EventContext) {
        self.events.lock().push(RecordedEvent::Info {
            message: message.to_string(),
            context: context.clone(),
        });
    }

    fn error(&self, error: &DispatchError, context: &EventContext) {
        self.events.lock().push(RecordedEvent::Error {
            error: error.clone(),
            context: context.clone(),
        });
    }
}
