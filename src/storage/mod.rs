//! Artifact storage
//!
//! Executors upload shard artifacts here; the coordinator's retention sweep
//! deletes them. Objects live under `runs/{run_id}/shard-{index}/{type}/{file}`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{StorageBackend, StorageConfig};

/// Artifact storage errors
#[derive(Error, Debug)]
pub enum ArtifactStoreError {
    #[error("Failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to delete {key}: {message}")]
    Delete { key: String, message: String },
}

/// Object storage seam
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Upload the file at `path` under `key`, returning its size in bytes
    async fn put(&self, key: &str, path: &Path, content_type: &str)
        -> Result<u64, ArtifactStoreError>;

    /// Delete `key`; deleting a missing object succeeds
    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError>;
}

/// Storage key of one artifact file
pub fn artifact_key(run_id: u64, shard_index: u32, kind: &str, file_name: &str) -> String {
    format!("runs/{run_id}/shard-{shard_index}/{kind}/{file_name}")
}

fn check_key(key: &str) -> Result<(), ArtifactStoreError> {
    let valid = !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(ArtifactStoreError::InvalidKey(key.to_string()))
    }
}

/// S3 or S3-compatible (MinIO) storage
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn connect(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "shardrun",
            ));
        }
        let shared_config = loader.load().await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            s3_builder = s3_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<u64, ArtifactStoreError> {
        check_key(key)?;
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|source| ArtifactStoreError::Read {
                path: path.display().to_string(),
                source,
            })?
            .len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| ArtifactStoreError::Upload {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| ArtifactStoreError::Upload {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        debug!("Uploaded s3://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError> {
        check_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| ArtifactStoreError::Delete {
                key: key.to_string(),
                message: err.to_string(),
            })?;
        Ok(())
    }
}

/// Directory-backed storage; the bucket is a subdirectory of the root
pub struct LocalArtifactStore {
    root: PathBuf,
    bucket: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(&self.bucket).join(key)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        key: &str,
        path: &Path,
        _content_type: &str,
    ) -> Result<u64, ArtifactStoreError> {
        check_key(key)?;
        let target = self.object_path(key);
        let upload_err = |err: io::Error| ArtifactStoreError::Upload {
            key: key.to_string(),
            message: err.to_string(),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ArtifactStoreError::Read {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            });
        }
        let size = tokio::fs::copy(path, &target).await.map_err(upload_err)?;
        debug!("Stored {} ({} bytes)", target.display(), size);
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactStoreError> {
        check_key(key)?;
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactStoreError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Build the configured artifact store
pub async fn build(config: &StorageConfig) -> Arc<dyn ArtifactStore> {
    match config.backend {
        StorageBackend::S3 => {
            info!(
                "Artifact storage: s3 bucket {} at {}",
                config.bucket,
                config.endpoint.as_deref().unwrap_or("default endpoint")
            );
            Arc::new(S3ArtifactStore::connect(config).await)
        }
        StorageBackend::Local => {
            let root = config.local_path();
            info!("Artifact storage: local directory {}", root.display());
            Arc::new(LocalArtifactStore::new(root, config.bucket.clone()))
        }
    }
}
