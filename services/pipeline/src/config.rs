//! Configuration for the image event pipeline.
//!
//! Two groups of settings live here: the Kafka connection used to carry the
//! fan-out topic, and the per-lane delivery policy (batching, receive count,
//! retention, concurrency and invocation timeout).

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL credentials (PLAIN or SCRAM)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    /// SASL mechanism, e.g. PLAIN or SCRAM-SHA-512
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

/// Consumer group settings for the topic subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "image-service".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Kafka connection carrying the fan-out topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic that object-storage and attribute-change notifications are published to
    #[serde(default = "default_notifications_topic")]
    pub notifications_topic: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// Path to CA certificate file
    pub ssl_ca_location: Option<String>,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "eda-pipeline".to_string()
}

fn default_notifications_topic() -> String {
    "eda.images.notifications".to_string()
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            notifications_topic: default_notifications_topic(),
            security_protocol: SecurityProtocol::default(),
            ssl_ca_location: None,
            sasl: SaslConfig::default(),
            consumer: ConsumerConfig::default(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("KAFKA_BOOTSTRAP_SERVERS") {
            config.bootstrap_servers = servers;
        }
        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(topic) = std::env::var("KAFKA_NOTIFICATIONS_TOPIC") {
            config.notifications_topic = topic;
        }
        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = match protocol.to_lowercase().as_str() {
                "ssl" => SecurityProtocol::Ssl,
                "sasl_plaintext" => SecurityProtocol::SaslPlaintext,
                "sasl_ssl" => SecurityProtocol::SaslSsl,
                "plaintext" => SecurityProtocol::Plaintext,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "KAFKA_SECURITY_PROTOCOL".to_string(),
                        message: format!("unknown protocol '{}'", other),
                    })
                }
            };
        }
        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.sasl.username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.sasl.password = Some(password);
        }
        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.ssl_ca_location = Some(ca);
        }

        config.validate()?;
        Ok(config)
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", &self.sasl.mechanism);
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", self.delivery_timeout_ms.to_string());
        config
    }

    /// Build a consumer ClientConfig. Offsets are committed manually once a
    /// message has been handed to the in-process topic.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("group.id", &self.consumer.group_id)
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.consumer.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.consumer.max_poll_interval_ms.to_string());
        config
    }

    /// Get producer delivery timeout as Duration
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }
        if self.notifications_topic.is_empty() {
            return Err(ConfigError::MissingRequired("notifications_topic".to_string()));
        }
        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }
        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Longest batching window a lane accepts
pub const MAX_BATCHING_WINDOW_SECS: u64 = 300;

/// Delivery policy of a queue lane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneConfig {
    /// Maximum messages handed to one consumer invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds to wait for a batch to fill after its first message arrives
    #[serde(default = "default_batching_window_secs")]
    pub batching_window_secs: u64,
    /// Receives allowed before a failing message moves to the dead-letter lane
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Seconds a message may wait in the lane before it expires
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Cap on concurrent consumer invocations (unbounded when absent)
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Per-invocation timeout in seconds
    #[serde(default = "default_invocation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    5
}

fn default_batching_window_secs() -> u64 {
    10
}

fn default_max_receive_count() -> u32 {
    1
}

fn default_retention_secs() -> u64 {
    60
}

fn default_invocation_timeout_secs() -> u64 {
    3
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batching_window_secs: default_batching_window_secs(),
            max_receive_count: default_max_receive_count(),
            retention_secs: default_retention_secs(),
            max_concurrency: None,
            timeout_secs: default_invocation_timeout_secs(),
        }
    }
}

impl LaneConfig {
    /// Lane feeding the processing consumer
    pub fn processing() -> Self {
        Self {
            timeout_secs: 15,
            ..Default::default()
        }
    }

    /// Lane feeding the dead-letter consumer. Retention is the usual four
    /// days of a queue without an explicit retention period.
    pub fn dead_letter() -> Self {
        Self {
            retention_secs: 4 * 24 * 60 * 60,
            max_concurrency: Some(5),
            ..Default::default()
        }
    }

    /// Batching window, clamped to [`MAX_BATCHING_WINDOW_SECS`]
    pub fn batching_window(&self) -> Duration {
        Duration::from_secs(self.batching_window_secs.min(MAX_BATCHING_WINDOW_SECS))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the lane policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_receive_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.batching_window_secs > MAX_BATCHING_WINDOW_SECS {
            return Err(ConfigError::InvalidValue {
                key: "batching_window_secs".to_string(),
                message: format!("must be at most {}", MAX_BATCHING_WINDOW_SECS),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrency".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}
