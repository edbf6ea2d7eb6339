//! Handoff of completed staging files to an object store
//!
//! The pipeline only needs "put this file under this key". [`Uploader`] is
//! that seam; [`ObjectStoreUploader`] implements it over any
//! [`object_store::ObjectStore`] backend and streams the file in parts
//! rather than reading it whole.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::{ObjectStore, WriteMultipart};
use tokio::io::AsyncReadExt;

use crate::config::{UploadBackend, UploadConfig};
use crate::error::{Result, StageError};
use crate::types::ObjectId;

/// Read size when streaming a staging file into a multipart upload
const UPLOAD_BUFFER_BYTES: usize = 1024 * 1024;

/// Parts allowed in flight for one upload
const UPLOAD_CONCURRENCY: usize = 4;

pub type DynStore = Arc<dyn ObjectStore>;

/// Trait for persistence collaborators that take completed staging files
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Store the file at `path` under the key for `id`.
    async fn upload(&self, id: &ObjectId, path: &Path) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Build the configured uploader, or `None` when handoff is disabled.
pub fn from_config(config: &UploadConfig) -> Result<Option<Arc<dyn Uploader>>> {
    let store: DynStore = match config.backend {
        UploadBackend::None => return Ok(None),
        UploadBackend::Memory => Arc::new(InMemory::new()),
        UploadBackend::Local => {
            let dir = config.local_dir.as_ref().ok_or_else(|| {
                StageError::Config("upload.local_dir is required for the local backend".to_string())
            })?;
            std::fs::create_dir_all(dir).map_err(|e| {
                StageError::Config(format!(
                    "Failed to create upload directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let fs = LocalFileSystem::new_with_prefix(dir)
                .map_err(|e| StageError::Config(format!("Invalid upload directory: {e}")))?;
            Arc::new(fs)
        }
        UploadBackend::S3 => {
            let bucket = config.bucket.as_ref().ok_or_else(|| {
                StageError::Config("upload.bucket is required for the s3 backend".to_string())
            })?;
            let s3 = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(&config.region)
                .build()
                .map_err(|e| StageError::Config(format!("Failed to configure S3: {e}")))?;
            Arc::new(s3)
        }
    };

    Ok(Some(Arc::new(ObjectStoreUploader::new(
        store,
        backend_name(config.backend),
        config.prefix.clone(),
    ))))
}

fn backend_name(backend: UploadBackend) -> &'static str {
    match backend {
        UploadBackend::None => "none",
        UploadBackend::Memory => "memory",
        UploadBackend::Local => "local",
        UploadBackend::S3 => "s3",
    }
}

/// Uploads staging files to an object store, keyed by `prefix + id`
pub struct ObjectStoreUploader {
    store: DynStore,
    name: &'static str,
    prefix: String,
}

impl ObjectStoreUploader {
    pub fn new(store: DynStore, name: &'static str, prefix: impl Into<String>) -> Self {
        Self {
            store,
            name,
            prefix: prefix.into(),
        }
    }

    /// Object key for `id`
    pub fn location(&self, id: &ObjectId) -> ObjPath {
        ObjPath::from(format!("{}{}", self.prefix, id))
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    async fn upload(&self, id: &ObjectId, path: &Path) -> Result<()> {
        let location = self.location(id);
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            StageError::UploadFailed(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let multipart = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|e| StageError::UploadFailed(format!("Failed to start upload: {e}")))?;
        let mut writer = WriteMultipart::new(multipart);

        let mut buf = vec![0u8; UPLOAD_BUFFER_BYTES];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(StageError::UploadFailed(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    )));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(UPLOAD_CONCURRENCY).await {
                let _ = writer.abort().await;
                return Err(StageError::UploadFailed(e.to_string()));
            }
            writer.write(&buf[..n]);
        }

        writer
            .finish()
            .await
            .map_err(|e| StageError::UploadFailed(format!("Failed to complete upload: {e}")))?;

        tracing::info!("Uploaded {} to {} store at {}", id, self.name, location);
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
