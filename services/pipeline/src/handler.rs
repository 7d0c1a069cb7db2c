//! Consumer contracts: per-event handlers for direct subscriptions, batch
//! handlers for queue lanes, and the error taxonomy both report with.

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::lane::LaneMessage;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// External collaborator a consumer depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    RecordStore,
    ObjectStore,
    Mailer,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::RecordStore => f.write_str("record store"),
            Dependency::ObjectStore => f.write_str("object store"),
            Dependency::Mailer => f.write_str("mailer"),
        }
    }
}

/// Errors a consumer reports for a single message
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),

    #[error("Rejected {resource_key}: {reason}")]
    Rejected { resource_key: String, reason: String },

    #[error("{dependency} call failed: {message}")]
    Dependency {
        dependency: Dependency,
        message: String,
    },

    #[error("Conditional update failed: no record for {resource_key}")]
    ConditionFailure { resource_key: String },

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn dependency(dependency: Dependency, error: impl fmt::Display) -> Self {
        PipelineError::Dependency {
            dependency,
            message: error.to_string(),
        }
    }

    pub fn rejected(resource_key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Rejected {
            resource_key: resource_key.into(),
            reason: reason.into(),
        }
    }

    /// Whether a later attempt could succeed. Lanes with a receive count of
    /// one dead-letter either way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Dependency { .. } | PipelineError::Timeout(_)
        )
    }
}

/// Handler behind a direct topic subscription, invoked once per envelope
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PipelineError>;
}

/// Result of one batch invocation: the messages that failed. Anything not
/// listed is acknowledged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub failed: Vec<Uuid>,
}

impl BatchOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn push_failure(&mut self, message_id: Uuid) {
        self.failed.push(message_id);
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Consumer attached to a queue lane
#[async_trait::async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, batch: &[LaneMessage]) -> BatchOutcome;
}
