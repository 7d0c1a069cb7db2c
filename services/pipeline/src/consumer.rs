//! Kafka consumer feeding the in-process fan-out topic.
//!
//! Each Kafka record is decoded into a [`TopicMessage`] and published on the
//! [`Topic`]; the offset is committed once the topic has taken the message.
//! Records that are not topic wrappers (raw bucket notifications published
//! straight from object storage) are wrapped on the fly, with Kafka headers
//! becoming message attributes.

use crate::config::KafkaConfig;
use crate::envelope::TopicMessage;
use crate::topic::Topic;
use chrono::{TimeZone, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the message ID of a raw (unwrapped) record
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),
}

/// A record as read from Kafka, before it is published on the topic
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl IncomingRecord {
    /// Decode the record into a topic message.
    ///
    /// Wrapped records keep their message ID and attributes. Anything else is
    /// carried verbatim as the body of a new message, so an undecodable
    /// notification still reaches the subscribers that report it.
    pub fn into_topic_message(self) -> TopicMessage {
        if let Ok(message) = TopicMessage::from_wire(&self.payload) {
            return message;
        }

        let mut message = TopicMessage::new(String::from_utf8_lossy(&self.payload).into_owned());
        if let Some(id) = self
            .headers
            .get(MESSAGE_ID_HEADER)
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            message.message_id = id;
        }
        if let Some(timestamp) = self
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        {
            message.timestamp = timestamp;
        }
        message.attributes = self
            .headers
            .into_iter()
            .filter(|(name, _)| name != MESSAGE_ID_HEADER)
            .collect();
        message
    }
}

/// Kafka consumer bound to the notifications topic
pub struct TopicConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TopicConsumer {
    /// Create a consumer and subscribe it to the notifications topic
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.consumer.group_id,
            topic = %config.notifications_topic,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.notifications_topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Handle that stops [`TopicConsumer::run`] when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    fn commit(&self, mode: CommitMode) -> Result<(), ConsumerError> {
        self.consumer
            .commit_consumer_state(mode)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    /// Consume records and publish them on the topic until shutdown
    #[instrument(skip_all, fields(topic = %topic.name()))]
    pub async fn run(&self, topic: &Topic) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let record = convert_message(&borrowed_message);
                            debug!(
                                partition = record.partition,
                                offset = record.offset,
                                size = record.payload.len(),
                                "Received record"
                            );

                            let delivered = topic.publish(record.into_topic_message());
                            metrics::counter!("consumer.records.consumed").increment(1);
                            if delivered.is_empty() {
                                metrics::counter!("consumer.records.unrouted").increment(1);
                            }

                            if let Err(e) = self.commit(CommitMode::Async) {
                                warn!(error = %e, "Failed to commit offsets asynchronously");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.commit(CommitMode::Sync) {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }
}

fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingRecord {
    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}
