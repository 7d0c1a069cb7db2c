//! Deletion processor: drops the record of a removed image.

use crate::record_store::RecordStore;
use async_trait::async_trait;
use eda_pipeline::{Dependency, EventEnvelope, EventHandler, EventKind, PipelineError};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct DeletionProcessor {
    records: Arc<dyn RecordStore>,
}

impl DeletionProcessor {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl EventHandler for DeletionProcessor {
    #[instrument(skip_all, fields(kind = %envelope.kind, resource_key = %envelope.resource_key))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PipelineError> {
        if envelope.kind != EventKind::Removed {
            return Ok(());
        }

        let existed = self
            .records
            .delete(&envelope.resource_key)
            .await
            .map_err(|e| PipelineError::dependency(Dependency::RecordStore, format!("{:#}", e)))?;

        if existed {
            info!("Image record deleted");
        } else {
            debug!("No record to delete");
        }
        Ok(())
    }
}
