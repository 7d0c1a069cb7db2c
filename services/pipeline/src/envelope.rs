//! Topic messages and the event envelopes unwrapped from them.
//!
//! Decoding is two explicit stages:
//!
//! 1. [`TopicMessage::from_wire`] reads the notification wrapper published on
//!    the fan-out topic. The wrapper carries message attributes (used for
//!    filtering) and the original notification as an opaque string.
//! 2. [`EventEnvelope::from_message`] parses that string into one envelope
//!    per affected object.
//!
//! A failure at either stage is an [`EnvelopeError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while unwrapping a notification
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("Failed to decode topic message: {0}")]
    Wrapper(String),

    #[error("Failed to decode wrapped notification: {0}")]
    Payload(String),

    #[error("Unsupported event name: {0}")]
    UnsupportedEvent(String),

    #[error("Notification carries no records")]
    NoRecords,

    #[error("Notification has no resource key")]
    MissingResourceKey,
}

/// Kind of change an envelope describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Removed,
    AttributeChanged,
}

impl EventKind {
    /// Classify an object-storage event name such as `ObjectCreated:Put`
    /// or `s3:ObjectRemoved:Delete`.
    pub fn from_event_name(name: &str) -> Result<Self, EnvelopeError> {
        let name = name.strip_prefix("s3:").unwrap_or(name);

        if name.starts_with("ObjectCreated") {
            Ok(EventKind::Created)
        } else if name.starts_with("ObjectRemoved") {
            Ok(EventKind::Removed)
        } else {
            Err(EnvelopeError::UnsupportedEvent(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Removed => "removed",
            EventKind::AttributeChanged => "attribute_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification as carried by the fan-out topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    /// Unique message ID, stable across lanes and redeliveries
    pub message_id: Uuid,
    /// When the message was published
    pub timestamp: DateTime<Utc>,
    /// The original notification, still encoded
    pub body: String,
    /// Message attributes evaluated by filter policies
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAttribute {
    #[serde(rename = "Type", default = "default_attribute_type")]
    data_type: String,
    #[serde(rename = "Value")]
    value: String,
}

fn default_attribute_type() -> String {
    "String".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "Type", default = "default_wire_type")]
    message_type: String,
    #[serde(rename = "MessageId")]
    message_id: Uuid,
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, WireAttribute>,
}

fn default_wire_type() -> String {
    "Notification".to_string()
}

impl TopicMessage {
    /// Create a message wrapping the given notification body
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add a message attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Decode the topic wrapper (first decode stage)
    pub fn from_wire(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireMessage =
            serde_json::from_slice(payload).map_err(|e| EnvelopeError::Wrapper(e.to_string()))?;

        if wire.message_type != "Notification" {
            return Err(EnvelopeError::Wrapper(format!(
                "unexpected message type '{}'",
                wire.message_type
            )));
        }

        Ok(Self {
            message_id: wire.message_id,
            timestamp: wire.timestamp,
            body: wire.message,
            attributes: wire
                .message_attributes
                .into_iter()
                .map(|(name, attribute)| (name, attribute.value))
                .collect(),
        })
    }

    /// Encode the topic wrapper
    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireMessage {
            message_type: default_wire_type(),
            message_id: self.message_id,
            timestamp: self.timestamp,
            message: self.body.clone(),
            message_attributes: self
                .attributes
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        WireAttribute {
                            data_type: default_attribute_type(),
                            value: value.clone(),
                        },
                    )
                })
                .collect(),
        };

        serde_json::to_vec(&wire).map_err(|e| EnvelopeError::Wrapper(e.to_string()))
    }

    /// Get a message attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Object details carried by object-storage notifications
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDetails {
    pub bucket: Option<String>,
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
}

/// Normalized representation of one inbound change
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub kind: EventKind,
    /// Key of the affected object, never empty
    pub resource_key: String,
    /// Attributes of an attribute-change event (empty otherwise)
    pub attributes: HashMap<String, String>,
    /// Object details for storage events
    pub object: Option<ObjectDetails>,
    /// The unwrapped notification text
    pub raw_body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageRecord {
    event_name: String,
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
    s3: StorageEntity,
}

#[derive(Debug, Deserialize)]
struct StorageEntity {
    #[serde(default)]
    bucket: Option<BucketEntity>,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    #[serde(default)]
    key: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "eTag", default)]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttributeChange {
    #[serde(default)]
    resource_key: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl EventEnvelope {
    /// Unwrap the notification carried by a topic message (second decode
    /// stage). Object-storage notifications yield one envelope per record.
    pub fn from_message(message: &TopicMessage) -> Result<Vec<Self>, EnvelopeError> {
        let body: Value = serde_json::from_str(&message.body)
            .map_err(|e| EnvelopeError::Payload(e.to_string()))?;

        if let Some(records) = body.get("Records") {
            Self::from_storage_records(records.clone(), &message.body)
        } else if body.get("resource_key").is_some() {
            Self::from_attribute_change(body, message).map(|envelope| vec![envelope])
        } else {
            Err(EnvelopeError::Payload(
                "neither an object-storage nor an attribute-change notification".to_string(),
            ))
        }
    }

    fn from_storage_records(records: Value, raw_body: &str) -> Result<Vec<Self>, EnvelopeError> {
        let records: Vec<StorageRecord> =
            serde_json::from_value(records).map_err(|e| EnvelopeError::Payload(e.to_string()))?;

        if records.is_empty() {
            return Err(EnvelopeError::NoRecords);
        }

        records
            .into_iter()
            .map(|record| {
                let kind = EventKind::from_event_name(&record.event_name)?;
                let resource_key = decode_object_key(&record.s3.object.key)?;

                Ok(Self {
                    kind,
                    resource_key,
                    attributes: HashMap::new(),
                    object: Some(ObjectDetails {
                        bucket: record.s3.bucket.map(|b| b.name),
                        size: record.s3.object.size,
                        etag: record.s3.object.etag,
                        event_time: record.event_time,
                    }),
                    raw_body: raw_body.to_string(),
                })
            })
            .collect()
    }

    fn from_attribute_change(body: Value, message: &TopicMessage) -> Result<Self, EnvelopeError> {
        let change: AttributeChange =
            serde_json::from_value(body).map_err(|e| EnvelopeError::Payload(e.to_string()))?;

        if change.resource_key.trim().is_empty() {
            return Err(EnvelopeError::MissingResourceKey);
        }

        // Message attributes are what subscribers were filtered on, so they win
        let mut attributes = change.attributes;
        attributes.extend(message.attributes.clone());

        Ok(Self {
            kind: EventKind::AttributeChanged,
            resource_key: change.resource_key,
            attributes,
            object: None,
            raw_body: message.body.clone(),
        })
    }

    /// Get an envelope attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Object keys in storage notifications are URL-encoded with `+` for spaces
fn decode_object_key(raw: &str) -> Result<String, EnvelopeError> {
    let key = urlencoding::decode(&raw.replace('+', " "))
        .map_err(|e| EnvelopeError::Payload(format!("object key is not valid UTF-8: {}", e)))?
        .into_owned();

    if key.is_empty() {
        return Err(EnvelopeError::MissingResourceKey);
    }

    Ok(key)
}

/// Build the body of an object-storage notification for a single object
pub fn storage_notification(event_name: &str, bucket: &str, key: &str) -> String {
    storage_notification_records(event_name, bucket, &[key])
}

/// Build the body of an object-storage notification with one record per key
pub fn storage_notification_records(event_name: &str, bucket: &str, keys: &[&str]) -> String {
    let event_time = Utc::now().to_rfc3339();
    let records: Vec<serde_json::Value> = keys
        .iter()
        .map(|key| {
            serde_json::json!({
                "eventName": event_name,
                "eventTime": event_time,
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": urlencoding::encode(key).replace("%20", "+") }
                }
            })
        })
        .collect();

    serde_json::json!({ "Records": records }).to_string()
}

/// Build the body of an attribute-change notification
pub fn attribute_change_notification(
    resource_key: &str,
    attributes: &HashMap<String, String>,
) -> String {
    serde_json::json!({
        "resource_key": resource_key,
        "attributes": attributes,
    })
    .to_string()
}
