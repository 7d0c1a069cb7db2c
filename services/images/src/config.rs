use eda_pipeline::{KafkaConfig, LaneConfig};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main configuration for the image service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka topic the notifications arrive on
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Object storage holding the images
    #[serde(default)]
    pub s3: S3Config,
    /// Record store
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Outgoing mail
    #[serde(default)]
    pub mail: MailConfig,
    /// Queue lane policies
    #[serde(default)]
    pub lanes: LanesConfig,
    /// Direct subscriber settings
    #[serde(default)]
    pub subscribers: SubscriberConfig,
    /// Processing consumer settings
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket the images are uploaded to
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Which record store implementation backs the service
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// PostgreSQL connection URL, required for the postgres backend
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// SMTP settings and fixed recipients. An empty host switches the mailer to
/// log-only mode.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "default_true")]
    pub use_starttls: bool,
    /// Sender address
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Recipient addresses
    #[serde(default)]
    pub to: Vec<String>,
}

/// Lane policies for the processing lane and its dead-letter lane
#[derive(Debug, Clone, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "LaneConfig::processing", deserialize_with = "processing_lane")]
    pub processing: LaneConfig,
    #[serde(default = "LaneConfig::dead_letter", deserialize_with = "dead_letter_lane")]
    pub dead_letter: LaneConfig,
}

/// Lane fields present in a config document. Absent fields keep the value
/// of the lane's own preset rather than the generic lane default.
#[derive(Debug, Default, Deserialize)]
struct LaneOverrides {
    batch_size: Option<usize>,
    batching_window_secs: Option<u64>,
    max_receive_count: Option<u32>,
    retention_secs: Option<u64>,
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
}

impl LaneOverrides {
    fn apply(self, mut lane: LaneConfig) -> LaneConfig {
        if let Some(batch_size) = self.batch_size {
            lane.batch_size = batch_size;
        }
        if let Some(window) = self.batching_window_secs {
            lane.batching_window_secs = window;
        }
        if let Some(max_receive_count) = self.max_receive_count {
            lane.max_receive_count = max_receive_count;
        }
        if let Some(retention) = self.retention_secs {
            lane.retention_secs = retention;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            lane.max_concurrency = Some(max_concurrency);
        }
        if let Some(timeout) = self.timeout_secs {
            lane.timeout_secs = timeout;
        }
        lane
    }
}

fn processing_lane<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LaneConfig, D::Error> {
    LaneOverrides::deserialize(deserializer).map(|o| o.apply(LaneConfig::processing()))
}

fn dead_letter_lane<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LaneConfig, D::Error> {
    LaneOverrides::deserialize(deserializer).map(|o| o.apply(LaneConfig::dead_letter()))
}

/// Settings shared by the directly invoked subscribers
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    /// Per-invocation timeout in seconds
    #[serde(default = "default_handler_timeout_secs")]
    pub timeout_secs: u64,
}

/// Processing consumer settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Accepted image file extensions, lowercase
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "image-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_mail_from() -> String {
    "images@localhost".to_string()
}

fn default_handler_timeout_secs() -> u64 {
    3
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["jpeg".to_string(), "jpg".to_string(), "png".to_string()]
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "image-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/images").required(false))
            .add_source(config::File::with_name("/etc/eda/images").required(false))
            // Override with environment variables
            // IMAGES__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("IMAGES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        self.kafka.validate()?;
        self.lanes.processing.validate()?;
        self.lanes.dead_letter.validate()?;

        if self.database.backend == StoreBackend::Postgres && self.database.url.is_none() {
            anyhow::bail!("database.url is required for the postgres backend");
        }
        if self.processing.allowed_extensions.is_empty() {
            anyhow::bail!("processing.allowed_extensions must not be empty");
        }
        Ok(())
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get the direct subscriber timeout as Duration
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribers.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            use_starttls: true,
            from: default_mail_from(),
            to: Vec::new(),
        }
    }
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            processing: LaneConfig::processing(),
            dead_letter: LaneConfig::dead_letter(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_handler_timeout_secs(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> Config {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config = parse(serde_json::json!({}));

        assert_eq!(config.lanes.processing.batch_size, 5);
        assert_eq!(config.lanes.processing.timeout_secs, 15);
        assert_eq!(config.lanes.dead_letter.max_concurrency, Some(5));
        assert_eq!(config.handler_timeout(), Duration::from_secs(3));
        assert_eq!(config.processing.allowed_extensions, vec!["jpeg", "jpg", "png"]);
        assert!(config.mail.smtp_host.is_empty());
    }

    #[test]
    fn test_partial_lane_sections_keep_lane_presets() {
        let config = parse(serde_json::json!({
            "lanes": {
                "processing": { "batch_size": 10 },
                "dead_letter": { "timeout_secs": 5 }
            }
        }));

        assert_eq!(config.lanes.processing.batch_size, 10);
        assert_eq!(config.lanes.processing.timeout_secs, 15);
        assert_eq!(config.lanes.dead_letter.timeout_secs, 5);
        assert_eq!(config.lanes.dead_letter.max_concurrency, Some(5));
        assert_eq!(config.lanes.dead_letter.retention_secs, 4 * 24 * 60 * 60);
    }

    #[test]
    fn test_postgres_backend_needs_url() {
        let config = parse(serde_json::json!({}));
        assert!(config.validate().is_err());

        let config = parse(serde_json::json!({ "database": { "backend": "memory" } }));
        assert!(config.validate().is_ok());

        let config = parse(serde_json::json!({
            "database": { "url": "postgres://localhost/images" }
        }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_lane_is_rejected() {
        let config = parse(serde_json::json!({
            "database": { "backend": "memory" },
            "lanes": { "dead_letter": { "max_concurrency": 0 } }
        }));
        assert!(config.validate().is_err());
    }
}
