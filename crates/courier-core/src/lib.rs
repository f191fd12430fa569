//! # Courier Core
//!
//! Core types and traits for the courier message dispatch layer:
//! - Message request and outcome types
//! - Per-key delivery status records
//! - Error taxonomy shared by every crate
//! - Provider capability trait and health vocabulary
//! - Observability sink for dispatch events

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod provider;
pub mod status;
pub mod types;

pub use error::{DispatchError, DispatchResult};
pub use events::{EventContext, EventSink, MemorySink, RecordedEvent, TracingSink};
pub use provider::{HealthCheck, HealthStatus, MessageProvider};
pub use status::{DeliveryState, DeliveryStatus};
pub use types::{IdempotencyKey, SendOutcome, SendRequest, SendRequestBuilder, DERIVED_KEY_BODY_PREFIX};
