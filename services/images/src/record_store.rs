use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Stored image record, keyed by the object key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Object key of the image
    pub image_name: String,
    /// Bucket the object lives in
    pub bucket: Option<String>,
    /// Content type reported by object storage
    pub content_type: Option<String>,
    /// Object size in bytes
    pub size_bytes: Option<i64>,
    /// Object entity tag
    pub etag: Option<String>,
    /// When the object was uploaded
    pub uploaded_at: DateTime<Utc>,
    /// Free-form attributes such as `caption`, as a JSON object
    pub attributes: serde_json::Value,
}

impl ImageRecord {
    pub fn new(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            bucket: None,
            content_type: None,
            size_bytes: None,
            etag: None,
            uploaded_at: Utc::now(),
            attributes: serde_json::json!({}),
        }
    }

    /// Get a string attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// Keyed image records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record. Attributes already stored for the key are
    /// kept.
    async fn put(&self, record: &ImageRecord) -> Result<()>;

    /// Set one attribute on an existing record. Returns `false` without
    /// writing anything when no record exists for the key.
    async fn update_attribute(&self, image_name: &str, name: &str, value: &str) -> Result<bool>;

    /// Delete a record. Returns whether one existed.
    async fn delete(&self, image_name: &str) -> Result<bool>;

    async fn get(&self, image_name: &str) -> Result<Option<ImageRecord>>;
}

/// Record store in PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is not configured")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(image_name = %record.image_name))]
    async fn put(&self, record: &ImageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO images (
                image_name, bucket, content_type, size_bytes, etag, uploaded_at, attributes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (image_name) DO UPDATE SET
                bucket = EXCLUDED.bucket,
                content_type = EXCLUDED.content_type,
                size_bytes = EXCLUDED.size_bytes,
                etag = EXCLUDED.etag,
                uploaded_at = EXCLUDED.uploaded_at,
                attributes = images.attributes || EXCLUDED.attributes,
                updated_at = NOW()
            "#,
        )
        .bind(&record.image_name)
        .bind(&record.bucket)
        .bind(&record.content_type)
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(record.uploaded_at)
        .bind(&record.attributes)
        .execute(&self.pool)
        .await
        .context("Failed to upsert image record")?;

        debug!("Image record stored");
        Ok(())
    }

    #[instrument(skip(self, value))]
    async fn update_attribute(&self, image_name: &str, name: &str, value: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET attributes = jsonb_set(attributes, ARRAY[$2], to_jsonb($3::text), true),
                updated_at = NOW()
            WHERE image_name = $1
            "#,
        )
        .bind(image_name)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to update image attribute")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, image_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM images WHERE image_name = $1")
            .bind(image_name)
            .execute(&self.pool)
            .await
            .context("Failed to delete image record")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get(&self, image_name: &str) -> Result<Option<ImageRecord>> {
        sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT image_name, bucket, content_type, size_bytes, etag, uploaded_at, attributes
            FROM images
            WHERE image_name = $1
            "#,
        )
        .bind(image_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch image record")
    }
}

/// Record store held in process memory
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: &ImageRecord) -> Result<()> {
        let mut records = self.records.write();
        let mut record = record.clone();

        if let Some(existing) = records.get(&record.image_name) {
            if let (Some(stored), Some(incoming)) = (
                existing.attributes.as_object(),
                record.attributes.as_object_mut(),
            ) {
                for (name, value) in stored {
                    incoming.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        records.insert(record.image_name.clone(), record);
        Ok(())
    }

    async fn update_attribute(&self, image_name: &str, name: &str, value: &str) -> Result<bool> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(image_name) else {
            return Ok(false);
        };

        if !record.attributes.is_object() {
            record.attributes = serde_json::json!({});
        }
        if let Some(attributes) = record.attributes.as_object_mut() {
            attributes.insert(name.to_string(), serde_json::Value::String(value.to_string()));
        }
        Ok(true)
    }

    async fn delete(&self, image_name: &str) -> Result<bool> {
        Ok(self.records.write().remove(image_name).is_some())
    }

    async fn get(&self, image_name: &str) -> Result<Option<ImageRecord>> {
        Ok(self.records.read().get(image_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemoryRecordStore::new();

        assert!(!store.update_attribute("cat.jpg", "caption", "a cat").await.unwrap());
        assert!(store.is_empty());

        store.put(&ImageRecord::new("cat.jpg")).await.unwrap();
        assert!(store.update_attribute("cat.jpg", "caption", "a cat").await.unwrap());

        let record = store.get("cat.jpg").await.unwrap().unwrap();
        assert_eq!(record.attribute("caption"), Some("a cat"));
    }

    #[tokio::test]
    async fn test_put_keeps_existing_attributes() {
        let store = MemoryRecordStore::new();
        store.put(&ImageRecord::new("cat.jpg")).await.unwrap();
        store.update_attribute("cat.jpg", "caption", "a cat").await.unwrap();

        let mut redelivered = ImageRecord::new("cat.jpg");
        redelivered.size_bytes = Some(2048);
        store.put(&redelivered).await.unwrap();

        let record = store.get("cat.jpg").await.unwrap().unwrap();
        assert_eq!(record.size_bytes, Some(2048));
        assert_eq!(record.attribute("caption"), Some("a cat"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_record() {
        let store = MemoryRecordStore::new();
        assert!(!store.delete("missing.jpg").await.unwrap());

        store.put(&ImageRecord::new("cat.jpg")).await.unwrap();
        assert!(store.delete("cat.jpg").await.unwrap());
        assert!(store.get("cat.jpg").await.unwrap().is_none());
    }
}
