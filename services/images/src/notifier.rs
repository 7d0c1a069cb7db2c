//! Confirmation notifier: mails the recipients when an image is created or
//! removed.

use crate::mailer::{Email, Mailer, Recipients};
use async_trait::async_trait;
use eda_pipeline::{Dependency, EventEnvelope, EventHandler, EventKind, PipelineError};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const INSERTED_SUBJECT: &str = "Image Inserted";
pub const DELETED_SUBJECT: &str = "Image Deleted";

pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    recipients: Recipients,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, recipients: Recipients) -> Self {
        Self { mailer, recipients }
    }

    /// The notification for an envelope, if its kind warrants one
    pub fn notification(&self, envelope: &EventEnvelope) -> Option<Email> {
        let key = &envelope.resource_key;
        match envelope.kind {
            EventKind::Created => Some(self.recipients.email(
                INSERTED_SUBJECT,
                &format!("Your image: {} has been uploaded.", key),
            )),
            EventKind::Removed => Some(self.recipients.email(
                DELETED_SUBJECT,
                &format!("Your image: {} has been deleted.", key),
            )),
            EventKind::AttributeChanged => None,
        }
    }
}

#[async_trait]
impl EventHandler for Notifier {
    #[instrument(skip_all, fields(kind = %envelope.kind, resource_key = %envelope.resource_key))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PipelineError> {
        let Some(email) = self.notification(envelope) else {
            debug!("No notification for this event");
            return Ok(());
        };

        self.mailer
            .send(&email)
            .await
            .map_err(|e| PipelineError::dependency(Dependency::Mailer, format!("{:#}", e)))?;

        info!(subject = %email.subject, "Notification sent");
        Ok(())
    }
}
