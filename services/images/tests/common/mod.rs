#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use eda_pipeline::envelope::{
    attribute_change_notification, storage_notification, storage_notification_records,
};
use eda_pipeline::TopicMessage;
use image_service::rejection::REJECTED_SUBJECT;
use image_service::{
    Dependencies, Email, ImagePipeline, ImageRecord, Mailer, MemoryRecordStore, ObjectInfo,
    ObjectStore, PipelineSettings, Recipients, RecordStore,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bucket holding a fixed set of keys
pub struct FakeObjectStore {
    keys: HashSet<String>,
}

impl FakeObjectStore {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.keys.contains(key).then(|| ObjectInfo {
            key: key.to_string(),
            bucket: "images".to_string(),
            content_type: Some("image/jpeg".to_string()),
            size_bytes: Some(2048),
            etag: None,
            last_modified: None,
        }))
    }
}

/// Mailer that keeps every email and tracks how many rejection sends overlap
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    delay: Option<Duration>,
    rejections_in_flight: AtomicUsize,
    max_rejections_in_flight: AtomicUsize,
}

impl RecordingMailer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_subject(&self, subject: &str) -> Vec<Email> {
        self.sent
            .lock()
            .iter()
            .filter(|email| email.subject == subject)
            .cloned()
            .collect()
    }

    pub fn max_rejections_in_flight(&self) -> usize {
        self.max_rejections_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        let rejection = email.subject == REJECTED_SUBJECT;
        if rejection {
            let now = self.rejections_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_rejections_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(email.clone());

        if rejection {
            self.rejections_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-memory record store counting conditional updates
#[derive(Default)]
pub struct CountingRecordStore {
    inner: MemoryRecordStore,
    updates: AtomicUsize,
}

impl CountingRecordStore {
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl RecordStore for CountingRecordStore {
    async fn put(&self, record: &ImageRecord) -> Result<()> {
        self.inner.put(record).await
    }

    async fn update_attribute(&self, image_name: &str, name: &str, value: &str) -> Result<bool> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_attribute(image_name, name, value).await
    }

    async fn delete(&self, image_name: &str) -> Result<bool> {
        self.inner.delete(image_name).await
    }

    async fn get(&self, image_name: &str) -> Result<Option<ImageRecord>> {
        self.inner.get(image_name).await
    }
}

pub struct Harness {
    pub pipeline: ImagePipeline,
    pub records: Arc<CountingRecordStore>,
    pub mailer: Arc<RecordingMailer>,
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        recipients: Recipients::new("images@example.com", vec!["ops@example.com".to_string()]),
        ..Default::default()
    }
}

pub fn start(bucket: &[&str], mailer: RecordingMailer, settings: PipelineSettings) -> Harness {
    let records = Arc::new(CountingRecordStore::default());
    let mailer = Arc::new(mailer);

    let pipeline = ImagePipeline::start(
        Dependencies {
            records: records.clone(),
            objects: Arc::new(FakeObjectStore::with_keys(bucket)),
            mailer: mailer.clone(),
        },
        settings,
    );

    Harness {
        pipeline,
        records,
        mailer,
    }
}

pub fn created(key: &str) -> TopicMessage {
    TopicMessage::new(storage_notification("ObjectCreated:Put", "images", key))
}

pub fn created_many(keys: &[&str]) -> TopicMessage {
    TopicMessage::new(storage_notification_records("ObjectCreated:Put", "images", keys))
}

pub fn removed(key: &str) -> TopicMessage {
    TopicMessage::new(storage_notification("ObjectRemoved:Delete", "images", key))
}

pub fn comment(key: &str, comment_type: &str, text: &str) -> TopicMessage {
    let attributes = HashMap::from([("caption_text".to_string(), text.to_string())]);
    TopicMessage::new(attribute_change_notification(key, &attributes))
        .with_attribute("comment_type", comment_type)
}
