//! Recording event bus.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use storefront_core::event::SerializedEvent;
use storefront_core::event_bus::{EventBus, EventBusError};

/// [`EventBus`] that keeps every published event in memory.
///
/// Can be switched into a failing mode to exercise publish-failure paths.
///
/// # Example
///
/// ```
/// use storefront_testing::RecordingEventBus;
/// use storefront_core::event::SerializedEvent;
/// use storefront_core::event_bus::EventBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RecordingEventBus::new();
/// bus.publish("order-completed", &SerializedEvent::new("T".into(), vec![], None)).await?;
/// assert_eq!(bus.published_to("order-completed").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingEventBus {
    events: Arc<Mutex<Vec<(String, SerializedEvent)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingEventBus {
    /// Create an empty, healthy bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every `(topic, event)` published so far.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Events published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<SerializedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of events published.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// True if nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventBus for RecordingEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "recording bus set to fail".to_string(),
                });
            }
            self.events.lock().unwrap().push((topic, event));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_mode_rejects_and_records_nothing() {
        let bus = RecordingEventBus::new();
        bus.set_failing(true);

        let result = bus
            .publish("t", &SerializedEvent::new("E".to_string(), vec![], None))
            .await;

        assert!(matches!(result, Err(EventBusError::PublishFailed { .. })));
        assert!(bus.is_empty());
    }
}
