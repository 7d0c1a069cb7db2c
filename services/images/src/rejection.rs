//! Dead-letter consumer: tells the recipients about every image the
//! processing consumer gave up on.

use crate::mailer::{Email, Mailer, Recipients};
use async_trait::async_trait;
use eda_pipeline::{BatchHandler, BatchOutcome, EventEnvelope, LaneMessage, TopicMessage};
use std::sync::Arc;
use tracing::{error, info, instrument};

pub const REJECTED_SUBJECT: &str = "Image Rejected";

/// Key reported when a dead-lettered message does not decode
pub const UNKNOWN_KEY: &str = "unknown";

pub struct RejectionMailer {
    mailer: Arc<dyn Mailer>,
    recipients: Recipients,
}

impl RejectionMailer {
    pub fn new(mailer: Arc<dyn Mailer>, recipients: Recipients) -> Self {
        Self { mailer, recipients }
    }

    /// Build the rejection mail for a dead-lettered message. A notification
    /// carrying several records names every one of them.
    pub fn rejection(&self, message: &TopicMessage) -> Email {
        let mut keys: Vec<String> = EventEnvelope::from_message(message)
            .map(|envelopes| envelopes.into_iter().map(|e| e.resource_key).collect())
            .unwrap_or_default();
        keys.dedup();

        let text = match keys.as_slice() {
            [] => format!("Your image: {} has been rejected.", UNKNOWN_KEY),
            [key] => format!("Your image: {} has been rejected.", key),
            keys => format!("Your images: {} have been rejected.", keys.join(", ")),
        };
        self.recipients.email(REJECTED_SUBJECT, &text)
    }
}

#[async_trait]
impl BatchHandler for RejectionMailer {
    /// Always succeeds: there is no tier beyond the dead-letter lane
    #[instrument(skip_all, fields(batch_size = batch.len()))]
    async fn handle_batch(&self, batch: &[LaneMessage]) -> BatchOutcome {
        for message in batch {
            let email = self.rejection(&message.message);

            match self.mailer.send(&email).await {
                Ok(()) => {
                    info!(message_id = %message.id(), "Rejection mail sent");
                    metrics::counter!("rejection.mails.sent").increment(1);
                }
                Err(e) => {
                    error!(
                        message_id = %message.id(),
                        error = %format!("{:#}", e),
                        "Failed to send rejection mail"
                    );
                    metrics::counter!("rejection.mails.failed").increment(1);
                }
            }
        }

        BatchOutcome::success()
    }
}
