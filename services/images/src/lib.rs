//! Image Service
//!
//! Consumes object-storage and attribute-change notifications for the image
//! bucket and reacts to them:
//!
//! - **Processing**: new images of an accepted type are looked up in object
//!   storage and recorded. Failures go to a dead-letter lane.
//! - **Rejection mail**: every dead-lettered image is reported by mail.
//! - **Notifications**: created and removed images are confirmed by mail.
//! - **Deletion**: records of removed images are deleted.
//! - **Metadata**: caption changes are written to existing records.

pub mod app;
pub mod config;
pub mod deletion;
pub mod mailer;
pub mod metadata;
pub mod notifier;
pub mod object_store;
pub mod processing;
pub mod record_store;
pub mod rejection;

pub use app::{Dependencies, ImagePipeline, PipelineSettings, ShutdownReport};
pub use config::Config;
pub use deletion::DeletionProcessor;
pub use mailer::{Email, Mailer, Recipients, SmtpMailer};
pub use metadata::MetadataUpdater;
pub use notifier::Notifier;
pub use object_store::{ObjectInfo, ObjectStore, S3ObjectStore};
pub use processing::ProcessingConsumer;
pub use record_store::{ImageRecord, MemoryRecordStore, PgRecordStore, RecordStore};
pub use rejection::RejectionMailer;
