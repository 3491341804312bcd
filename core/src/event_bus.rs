//! Event bus abstraction for post-commit notifications.
//!
//! Order completion is recorded in an outbox row inside the order's database
//! transaction. Only after that transaction commits is the notification handed
//! to an [`EventBus`]. A publish failure never undoes the order; the outbox row
//! stays pending and can be relayed later.
//!
//! ```text
//! ┌──────────────────┐     commit     ┌──────────────┐   publish   ┌──────────┐
//! │ order + outbox   │ ─────────────► │ order service│ ──────────► │ EventBus │
//! │ (one unit of work)│               └──────────────┘             └──────────┘
//! └──────────────────┘
//! ```
//!
//! # Implementations
//!
//! - `RedpandaEventBus` (crate `storefront-redpanda`) - Kafka-compatible broker
//! - `RecordingEventBus` (crate `storefront-testing`) - captures events in memory

use crate::event::SerializedEvent;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

/// Publish side of a message broker.
///
/// Delivery is at-least-once; consumers must tolerate duplicates (the outbox
/// relay may publish an event a second time).
///
/// # Dyn Compatibility
///
/// Returns `Pin<Box<dyn Future>>` so services can hold `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the event
    /// or the delivery times out.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_failure_mentions_topic() {
        let err = EventBusError::PublishFailed {
            topic: "order-completed".to_string(),
            reason: "broker down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Publish failed for topic 'order-completed': broker down"
        );
    }
}
