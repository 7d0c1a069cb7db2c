//! Wiring of the image topic: lanes, subscriptions and their consumers.
//!
//! ```text
//!                      ┌──────────────────┐ fail ┌──────────────────┐
//!                 ┌───▶│ processing lane  │─────▶│ dead-letter lane │
//!                 │    │ ProcessingConsumer│      │ RejectionMailer  │
//! ┌────────────┐  │    └──────────────────┘      └──────────────────┘
//! │ image topic│──┼───▶ notifier   (Notifier)
//! └────────────┘  ├───▶ deletion   (DeletionProcessor)
//!                 └───▶ metadata   (MetadataUpdater, comment_type = Caption)
//! ```

use crate::config::Config;
use crate::deletion::DeletionProcessor;
use crate::mailer::{Mailer, Recipients};
use crate::metadata::MetadataUpdater;
use crate::notifier::Notifier;
use crate::object_store::ObjectStore;
use crate::processing::ProcessingConsumer;
use crate::record_store::RecordStore;
use crate::rejection::RejectionMailer;
use anyhow::{Context, Result};
use eda_pipeline::{LaneConfig, LaneStats, QueueLane, Router, Subscription, Topic, TopicMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub const TOPIC_NAME: &str = "images";
pub const PROCESSING_LANE: &str = "processing";
pub const DEAD_LETTER_LANE: &str = "dead-letter";
pub const NOTIFIER: &str = "notifier";
pub const DELETION: &str = "deletion";
pub const METADATA: &str = "metadata";

/// External collaborators of the consumers
#[derive(Clone)]
pub struct Dependencies {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub mailer: Arc<dyn Mailer>,
}

/// Delivery settings of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub processing_lane: LaneConfig,
    pub dead_letter_lane: LaneConfig,
    pub handler_timeout: Duration,
    pub allowed_extensions: Vec<String>,
    pub recipients: Recipients,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing_lane: config.lanes.processing.clone(),
            dead_letter_lane: config.lanes.dead_letter.clone(),
            handler_timeout: config.handler_timeout(),
            allowed_extensions: config.processing.allowed_extensions.clone(),
            recipients: Recipients::from_config(&config.mail),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            processing_lane: LaneConfig::processing(),
            dead_letter_lane: LaneConfig::dead_letter(),
            handler_timeout: Duration::from_secs(3),
            allowed_extensions: vec!["jpeg".to_string(), "jpg".to_string(), "png".to_string()],
            recipients: Recipients::new("images@localhost", Vec::new()),
        }
    }
}

/// What each lane did before the pipeline stopped
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    pub processing: LaneStats,
    pub dead_letter: LaneStats,
}

/// The running pipeline
pub struct ImagePipeline {
    topic: Topic,
    processing: JoinHandle<LaneStats>,
    dead_letter: JoinHandle<LaneStats>,
}

impl ImagePipeline {
    /// Spawn both lanes and declare every subscription on the topic
    pub fn start(deps: Dependencies, settings: PipelineSettings) -> Self {
        let (dead_letter_sender, dead_letter_lane) =
            QueueLane::new(DEAD_LETTER_LANE, settings.dead_letter_lane);
        let (processing_sender, processing_lane) =
            QueueLane::new(PROCESSING_LANE, settings.processing_lane);
        let processing_lane = processing_lane.with_dead_letter(dead_letter_sender);

        let rejection = Arc::new(RejectionMailer::new(
            deps.mailer.clone(),
            settings.recipients.clone(),
        ));
        let processing = Arc::new(ProcessingConsumer::new(
            deps.records.clone(),
            deps.objects.clone(),
            settings.allowed_extensions,
        ));

        let dead_letter = tokio::spawn(dead_letter_lane.run(rejection));
        let processing = tokio::spawn(processing_lane.run(processing));

        let timeout = settings.handler_timeout;
        let router = Router::new()
            .subscribe(Subscription::queue(PROCESSING_LANE, processing_sender))
            .subscribe(Subscription::handler(
                NOTIFIER,
                Arc::new(Notifier::new(deps.mailer, settings.recipients)),
                timeout,
            ))
            .subscribe(Subscription::handler(
                DELETION,
                Arc::new(DeletionProcessor::new(deps.records.clone())),
                timeout,
            ))
            .subscribe(
                Subscription::handler(
                    METADATA,
                    Arc::new(MetadataUpdater::new(deps.records)),
                    timeout,
                )
                .with_policy(MetadataUpdater::policy()),
            );

        info!(
            subscriptions = router.subscriptions().len(),
            "Image pipeline started"
        );

        Self {
            topic: Topic::new(TOPIC_NAME, router),
            processing,
            dead_letter,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Publish a message on the image topic
    pub fn publish(&self, message: TopicMessage) -> Vec<String> {
        self.topic.publish(message)
    }

    /// Stop accepting messages, then wait for the handlers and both lanes to
    /// drain
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        let Self {
            topic,
            processing,
            dead_letter,
        } = self;

        topic.drain().await;
        // Dropping the topic releases the processing lane's only sender
        drop(topic);

        let processing = processing
            .await
            .context("Processing lane task failed")?;
        let dead_letter = dead_letter
            .await
            .context("Dead-letter lane task failed")?;

        let report = ShutdownReport {
            processing,
            dead_letter,
        };
        info!(?report, "Image pipeline stopped");
        Ok(report)
    }
}
