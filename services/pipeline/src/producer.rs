//! Kafka producer publishing topic messages.
//!
//! Messages are written in their wrapped form, keyed by message ID, with the
//! message attributes repeated as Kafka headers.

use crate::config::KafkaConfig;
use crate::envelope::TopicMessage;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message_id: String,
}

/// Publisher for the notifications topic
pub struct TopicPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl TopicPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.notifications_topic,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.notifications_topic.clone(),
            timeout: config.delivery_timeout(),
        })
    }

    /// Publish a message and wait for delivery confirmation
    #[instrument(skip_all, fields(topic = %self.topic, message_id = %message.message_id))]
    pub async fn publish(&self, message: &TopicMessage) -> Result<DeliveryResult, ProducerError> {
        let payload = message
            .to_wire()
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        let key = message.message_id.to_string();

        let mut headers = OwnedHeaders::new();
        for (name, value) in &message.attributes {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(&payload)
            .headers(headers);

        debug!(size = payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic: self.topic.clone(),
            partition,
            offset,
            message_id: key,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for TopicPublisher {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}
