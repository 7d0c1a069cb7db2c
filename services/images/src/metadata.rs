//! Metadata updater: applies caption changes to existing image records.

use crate::record_store::RecordStore;
use async_trait::async_trait;
use eda_pipeline::{
    Dependency, EnvelopeError, EventEnvelope, EventHandler, EventKind, FilterPolicy,
    PipelineError,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Message attribute the subscription filters on
pub const COMMENT_TYPE: &str = "comment_type";
/// Envelope attribute carrying the new caption
pub const CAPTION_TEXT: &str = "caption_text";
/// Record attribute the caption is stored under
pub const CAPTION: &str = "caption";

pub struct MetadataUpdater {
    records: Arc<dyn RecordStore>,
}

impl MetadataUpdater {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Only caption changes reach the updater
    pub fn policy() -> FilterPolicy {
        FilterPolicy::match_all().one_of(COMMENT_TYPE, ["Caption"])
    }
}

#[async_trait]
impl EventHandler for MetadataUpdater {
    #[instrument(skip_all, fields(kind = %envelope.kind, resource_key = %envelope.resource_key))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PipelineError> {
        if envelope.kind != EventKind::AttributeChanged {
            debug!("Not an attribute change");
            return Ok(());
        }

        let caption = envelope.attribute(CAPTION_TEXT).ok_or_else(|| {
            EnvelopeError::Payload(format!("missing '{}' attribute", CAPTION_TEXT))
        })?;

        let updated = self
            .records
            .update_attribute(&envelope.resource_key, CAPTION, caption)
            .await
            .map_err(|e| PipelineError::dependency(Dependency::RecordStore, format!("{:#}", e)))?;

        if !updated {
            warn!("Caption change for an image without a record");
            return Err(PipelineError::ConditionFailure {
                resource_key: envelope.resource_key.clone(),
            });
        }

        info!("Caption updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::MockRecordStore;
    use eda_pipeline::envelope::attribute_change_notification;
    use eda_pipeline::TopicMessage;
    use mockall::predicate::eq;
    use std::collections::HashMap;

    fn caption_change(key: &str, caption: Option<&str>) -> EventEnvelope {
        let mut attributes = HashMap::new();
        if let Some(caption) = caption {
            attributes.insert(CAPTION_TEXT.to_string(), caption.to_string());
        }
        let message = TopicMessage::new(attribute_change_notification(key, &attributes))
            .with_attribute(COMMENT_TYPE, "Caption");
        EventEnvelope::from_message(&message).unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_caption_is_written_once() {
        let mut records = MockRecordStore::new();
        records
            .expect_update_attribute()
            .with(eq("cat.jpg"), eq(CAPTION), eq("a cat"))
            .times(1)
            .returning(|_, _, _| Ok(true));
        let updater = MetadataUpdater::new(Arc::new(records));

        assert!(updater
            .handle(&caption_change("cat.jpg", Some("a cat")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_record_is_condition_failure() {
        let mut records = MockRecordStore::new();
        records
            .expect_update_attribute()
            .times(1)
            .returning(|_, _, _| Ok(false));
        records.expect_put().never();
        let updater = MetadataUpdater::new(Arc::new(records));

        let result = updater.handle(&caption_change("cat.jpg", Some("a cat"))).await;
        assert!(matches!(
            result,
            Err(PipelineError::ConditionFailure { resource_key }) if resource_key == "cat.jpg"
        ));
    }

    #[tokio::test]
    async fn test_missing_caption_is_malformed() {
        let mut records = MockRecordStore::new();
        records.expect_update_attribute().never();
        let updater = MetadataUpdater::new(Arc::new(records));

        assert!(matches!(
            updater.handle(&caption_change("cat.jpg", None)).await,
            Err(PipelineError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_policy_admits_captions_only() {
        let policy = MetadataUpdater::policy();
        let attrs = |value: &str| HashMap::from([(COMMENT_TYPE.to_string(), value.to_string())]);

        assert!(policy.matches(&attrs("Caption")));
        assert!(!policy.matches(&attrs("Rating")));
        assert!(!policy.matches(&HashMap::new()));
    }
}
