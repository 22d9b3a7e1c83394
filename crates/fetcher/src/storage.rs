use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use imgflow_bus::ProcessingType;
use imgflow_core::config::StorageConfig;
use imgflow_core::StorageBackend;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use thiserror::Error;
use tracing::info;

pub const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for processed images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Encode and upload `image`; returns the object key.
    async fn put(&self, image: &DynamicImage, kind: ProcessingType) -> Result<String, StorageError>;

    /// Stored size of an object in bytes.
    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    /// Storage path reported downstream for `key`.
    fn location(&self, key: &str) -> String;
}

/// `YYYYMMDDHHMMSS_<nanos>_<type>.jpg`
pub fn object_key(at: DateTime<Utc>, kind: ProcessingType) -> String {
    format!("{}_{}.jpg", at.format("%Y%m%d%H%M%S_%9f"), kind)
}

/// JPEG-encode at [`JPEG_QUALITY`]. Layouts JPEG cannot hold (alpha,
/// 16-bit) are flattened to 8-bit RGB first.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let encodable: Cow<'_, DynamicImage> = match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => Cow::Borrowed(image),
        other => Cow::Owned(DynamicImage::ImageRgb8(other.to_rgb8())),
    };
    let mut buf = Vec::new();
    encodable.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
    Ok(buf)
}

/// [`ImageStore`] on top of any `object_store` backend.
#[derive(Clone)]
pub struct ObjectImageStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectImageStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn in_memory(bucket: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), bucket)
    }

    /// Build the configured backend. The S3 bucket must already exist.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config.backend {
            StorageBackend::S3 => {
                let endpoint = config.endpoint_url();
                let store = AmazonS3Builder::new()
                    .with_region(&config.region)
                    .with_bucket_name(&config.bucket)
                    .with_endpoint(&endpoint)
                    .with_allow_http(endpoint.starts_with("http://"))
                    .with_access_key_id(&config.access_key)
                    .with_secret_access_key(&config.secret_key)
                    .build()?;
                info!(endpoint = %endpoint, bucket = %config.bucket, "storage: S3 backend");
                Ok(Self::new(Arc::new(store), &config.bucket))
            }
            StorageBackend::Local => {
                let dir = Path::new(&config.local_dir);
                std::fs::create_dir_all(dir)?;
                let store = LocalFileSystem::new_with_prefix(dir)?;
                info!(dir = %dir.display(), "storage: local backend");
                Ok(Self::new(Arc::new(store), &config.bucket))
            }
            StorageBackend::Memory => {
                info!("storage: in-memory backend");
                Ok(Self::in_memory(&config.bucket))
            }
        }
    }
}

#[async_trait]
impl ImageStore for ObjectImageStore {
    async fn put(&self, image: &DynamicImage, kind: ProcessingType) -> Result<String, StorageError> {
        let data = encode_jpeg(image)?;
        let key = object_key(Utc::now(), kind);
        let path = object_store::path::Path::from(key.as_str());
        self.store.put(&path, bytes::Bytes::from(data).into()).await?;
        Ok(key)
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let path = object_store::path::Path::from(key);
        let meta = self.store.head(&path).await?;
        Ok(meta.size as u64)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
