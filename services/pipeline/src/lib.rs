//! EDA Pipeline - event fan-out for the image service
//!
//! Object-storage notifications and attribute-change events arrive on a Kafka
//! topic. This library decodes them, routes each message to every subscriber
//! whose filter policy matches and delivers it either directly to a handler or
//! through a buffered queue lane with batching, bounded receives and
//! dead-letter escalation.
//!
//! # Example
//!
//! ```rust,no_run
//! use eda_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn wire(processing: Arc<dyn BatchHandler>) -> anyhow::Result<()> {
//! let (sender, lane) = QueueLane::new("processing", LaneConfig::processing());
//! tokio::spawn(lane.run(processing));
//!
//! let topic = Topic::new(
//!     "images",
//!     Router::new().subscribe(Subscription::queue("processing", sender)),
//! );
//!
//! let consumer = TopicConsumer::new(KafkaConfig::from_env()?)?;
//! consumer.run(&topic).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod filter;
pub mod handler;
pub mod lane;
pub mod producer;
pub mod router;
pub mod topic;

// Re-export main types
pub use config::{ConfigError, ConsumerConfig, KafkaConfig, LaneConfig, SaslConfig, SecurityProtocol};
pub use consumer::{ConsumerError, IncomingRecord, TopicConsumer};
pub use envelope::{EnvelopeError, EventEnvelope, EventKind, ObjectDetails, TopicMessage};
pub use filter::{FilterCondition, FilterPolicy};
pub use handler::{BatchHandler, BatchOutcome, Dependency, EventHandler, PipelineError};
pub use lane::{LaneError, LaneMessage, LaneSender, LaneStats, QueueLane};
pub use producer::{DeliveryResult, ProducerError, TopicPublisher};
pub use router::{Endpoint, Router, RoutingDecision, Subscription};
pub use topic::Topic;

/// Async trait for handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_trait;
    pub use crate::config::{KafkaConfig, LaneConfig};
    pub use crate::consumer::TopicConsumer;
    pub use crate::envelope::{EventEnvelope, EventKind, TopicMessage};
    pub use crate::filter::FilterPolicy;
    pub use crate::handler::{BatchHandler, BatchOutcome, EventHandler, PipelineError};
    pub use crate::lane::{LaneMessage, QueueLane};
    pub use crate::producer::TopicPublisher;
    pub use crate::router::{Router, Subscription};
    pub use crate::topic::Topic;
}
