//! Chart upload to object storage.

use async_trait::async_trait;
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::UploadError;

/// Destination for rendered charts.
#[async_trait]
pub trait ChartStore: Send + Sync {
    /// Store a PNG and return the public URL it is served from.
    async fn upload(&self, png: Vec<u8>) -> Result<String, UploadError>;
}

/// S3 connection settings.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
}

/// [`ChartStore`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    public_url_base: String,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>, public_url_base: &str) -> Self {
        Self {
            store,
            public_url_base: public_url_base.trim_end_matches('/').to_string(),
        }
    }

    /// Uploader for an S3 bucket. Credentials come from the usual AWS
    /// environment variables.
    pub fn s3(settings: &S3Settings, public_url_base: &str) -> Result<Self, UploadError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        Ok(Self::new(Arc::new(builder.build()?), public_url_base))
    }

    fn object_key() -> String {
        format!("pictures/{}_{}.png", Uuid::new_v4(), Utc::now().timestamp())
    }
}

#[async_trait]
impl ChartStore for ObjectStoreUploader {
    async fn upload(&self, png: Vec<u8>) -> Result<String, UploadError> {
        let key = Self::object_key();
        let size = png.len();
        self.store
            .put(&Path::from(key.as_str()), PutPayload::from(png))
            .await?;

        let url = format!("{}/{key}", self.public_url_base);
        debug!(url = %url, bytes = size, "Chart uploaded");
        Ok(url)
    }
}
