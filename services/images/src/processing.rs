//! Processing consumer behind the processing lane: validates newly created
//! images and records them.

use crate::object_store::ObjectStore;
use crate::record_store::{ImageRecord, RecordStore};
use async_trait::async_trait;
use chrono::Utc;
use eda_pipeline::{
    BatchHandler, BatchOutcome, Dependency, EventEnvelope, EventKind, LaneMessage, PipelineError,
    TopicMessage,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct ProcessingConsumer {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    allowed_extensions: Vec<String>,
}

impl ProcessingConsumer {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            records,
            objects,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
        }
    }

    /// Process one lane message. Every envelope is attempted; the message
    /// fails with the first error when any of them fails.
    #[instrument(skip_all, fields(message_id = %message.message_id))]
    pub async fn process(&self, message: &TopicMessage) -> Result<(), PipelineError> {
        let mut first_error = None;

        for envelope in EventEnvelope::from_message(message)? {
            match envelope.kind {
                EventKind::Created => {
                    if let Err(e) = self.record_image(&envelope).await {
                        warn!(resource_key = %envelope.resource_key, error = %e, "Image not recorded");
                        first_error.get_or_insert(e);
                    }
                }
                EventKind::Removed | EventKind::AttributeChanged => {
                    debug!(
                        kind = %envelope.kind,
                        resource_key = %envelope.resource_key,
                        "Nothing to process"
                    );
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn record_image(&self, envelope: &EventEnvelope) -> Result<(), PipelineError> {
        let key = envelope.resource_key.as_str();
        self.check_image_type(key)?;

        let object = self
            .objects
            .head(key)
            .await
            .map_err(|e| PipelineError::dependency(Dependency::ObjectStore, format!("{:#}", e)))?
            .ok_or_else(|| PipelineError::rejected(key, "object does not exist"))?;

        let details = envelope.object.as_ref();
        let record = ImageRecord {
            image_name: key.to_string(),
            bucket: details
                .and_then(|d| d.bucket.clone())
                .or_else(|| Some(object.bucket.clone())),
            content_type: object.content_type,
            size_bytes: object
                .size_bytes
                .or_else(|| details.and_then(|d| d.size).and_then(|s| i64::try_from(s).ok())),
            etag: object.etag.or_else(|| details.and_then(|d| d.etag.clone())),
            uploaded_at: details
                .and_then(|d| d.event_time)
                .or(object.last_modified)
                .unwrap_or_else(Utc::now),
            attributes: serde_json::json!({}),
        };

        self.records
            .put(&record)
            .await
            .map_err(|e| PipelineError::dependency(Dependency::RecordStore, format!("{:#}", e)))?;

        info!(
            resource_key = %key,
            size_bytes = ?record.size_bytes,
            "Image recorded"
        );
        Ok(())
    }

    fn check_image_type(&self, key: &str) -> Result<(), PipelineError> {
        let extension = Path::new(key)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| PipelineError::rejected(key, "could not determine image type"))?;

        if !self.allowed_extensions.contains(&extension) {
            return Err(PipelineError::rejected(
                key,
                format!("unsupported image type '{}'", extension),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for ProcessingConsumer {
    async fn handle_batch(&self, batch: &[LaneMessage]) -> BatchOutcome {
        let mut outcome = BatchOutcome::success();

        for message in batch {
            if let Err(e) = self.process(&message.message).await {
                warn!(
                    message_id = %message.id(),
                    receive_count = message.receive_count,
                    transient = e.is_transient(),
                    error = %e,
                    "Processing failed"
                );
                metrics::counter!("processing.messages.failed").increment(1);
                outcome.push_failure(message.id());
            } else {
                metrics::counter!("processing.messages.processed").increment(1);
            }
        }

        outcome
    }
}
