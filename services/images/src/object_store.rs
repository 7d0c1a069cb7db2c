use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, instrument};

/// Object metadata as reported by object storage
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub bucket: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Read-only view of the image bucket
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object metadata. `None` when the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;
}

/// Object store backed by S3 or an S3-compatible service
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                debug!(content_type = ?output.content_type(), "Object found");
                Ok(Some(ObjectInfo {
                    key: key.to_string(),
                    bucket: self.bucket.clone(),
                    content_type: output.content_type().map(str::to_string),
                    size_bytes: output.content_length(),
                    etag: output.e_tag().map(|etag| etag.trim_matches('"').to_string()),
                    last_modified: output
                        .last_modified()
                        .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single()),
                }))
            }
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(e).context("Failed to read object metadata")
                }
            }
        }
    }
}
