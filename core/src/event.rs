//! Event trait and wire envelope.
//!
//! Domain notifications (for example an order reaching `Paid`) are serialized
//! with `bincode` and wrapped in a [`SerializedEvent`] before they are handed
//! to an [`EventBus`](crate::event_bus::EventBus).
//!
//! # Example
//!
//! ```
//! use storefront_core::event::{Event, SerializedEvent};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderCompleted {
//!     order_id: u64,
//! }
//!
//! impl Event for OrderCompleted {
//!     fn event_type(&self) -> &'static str {
//!         "OrderCompleted.v1"
//!     }
//! }
//!
//! let envelope = SerializedEvent::from_event(&OrderCompleted { order_id: 1 }, None).unwrap();
//! assert_eq!(envelope.event_type, "OrderCompleted.v1");
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A domain event that can cross a process boundary.
///
/// `event_type()` should return a stable, versioned name such as
/// `"OrderCompleted.v1"` so consumers can route and evolve schemas.
pub trait Event: Send + Sync + 'static {
    /// Versioned event type identifier.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "OrderCompleted.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional JSON metadata (`order_id`, `published_at`, ...).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Serialize `event` into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}
