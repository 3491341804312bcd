//! Redpanda event publisher for the storefront backend.
//!
//! Implements the publish side of [`EventBus`] on top of rdkafka, so any
//! Kafka-compatible broker (Redpanda, Apache Kafka, MSK) can receive order
//! completion notifications.
//!
//! # Wire format
//!
//! | Kafka field | Content |
//! |---|---|
//! | key | `metadata.partition_key` if present, else the event type |
//! | payload | [`SerializedEvent::data`] (bincode) |
//! | header `event_type` | [`SerializedEvent::event_type`] |
//! | header `metadata` | [`SerializedEvent::metadata`] as JSON, if any |
//!
//! Keying by `partition_key` keeps every event of one order on one partition.
//!
//! # Example
//!
//! ```no_run
//! use storefront_redpanda::RedpandaEventBus;
//! use storefront_core::event_bus::EventBus;
//! use storefront_core::event::SerializedEvent;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! let event = SerializedEvent::new(
//!     "OrderCompleted.v1".to_string(),
//!     vec![1, 2, 3],
//!     Some(serde_json::json!({ "partition_key": "42" })),
//! );
//! event_bus.publish("order-completed", &event).await?;
//! # Ok(())
//! # }
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use storefront_core::event::SerializedEvent;
use storefront_core::event_bus::{EventBus, EventBusError};

/// Header carrying the event type.
pub const EVENT_TYPE_HEADER: &str = "event_type";

/// Header carrying JSON metadata.
pub const METADATA_HEADER: &str = "metadata";

/// Redpanda event publisher.
///
/// # Example
///
/// ```no_run
/// use storefront_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
}

impl RedpandaEventBus {
    /// Create a publisher with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap brokers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Send timeout per event.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker list (e.g., `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`. Default `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec. Default `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Send timeout. Default 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the publisher.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are missing or the
    /// producer configuration is invalid.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            timeout_ms = timeout.as_millis(),
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
        })
    }
}

/// Message key for `event`.
fn partition_key(event: &SerializedEvent) -> String {
    event
        .metadata
        .as_ref()
        .and_then(|m| m.get("partition_key"))
        .map_or_else(
            || event.event_type.clone(),
            |key| key.as_str().map_or_else(|| key.to_string(), str::to_string),
        )
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let key = partition_key(&event);
            let metadata = event
                .metadata
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()
                .map_err(|e| EventBusError::PublishFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to encode metadata: {e}"),
                })?;

            let mut headers = OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(event.event_type.as_str()),
            });
            if let Some(metadata) = &metadata {
                headers = headers.insert(Header {
                    key: METADATA_HEADER,
                    value: Some(metadata.as_slice()),
                });
            }

            let record = FutureRecord::to(&topic)
                .key(key.as_str())
                .payload(event.data.as_slice())
                .headers(headers);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = %key,
                        event_type = %event.event_type,
                        "Event published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}
