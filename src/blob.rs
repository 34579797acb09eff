//! Blob storage: uploads, per-page source blobs, and
//! final Markdown results all flow through this trait.
//!
//! S3/MinIO-compatible via `aws-sdk-s3`, since the pipeline's blobs
//! are shared across worker processes. An in-memory implementation
//! covers tests without a live bucket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::BlobStoreError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;
    async fn presigned_url(&self, key: &str, expires_seconds: u64) -> Result<String, BlobStoreError>;
}

/// Production blob store: S3-API-compatible (MinIO in deployment).
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }

    pub async fn from_endpoint(endpoint: Option<&str>, region: &str) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&shared_config);
        Self { client, bucket: "pipeline".to_string() }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(bytes.to_vec().into())
            .send()
            .await
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;
        let output = match result {
            Ok(output) => output,
            Err(aws_sdk_s3::error::SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(BlobStoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(BlobStoreError::Storage(e.to_string())),
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(aws_sdk_s3::error::SdkError::ServiceError(e)) if e.err().is_not_found() => {
                Ok(false)
            }
            Err(e) => Err(BlobStoreError::Storage(e.to_string())),
        }
    }

    async fn presigned_url(&self, key: &str, expires_seconds: u64) -> Result<String, BlobStoreError> {
        let expires = aws_sdk_s3::presigning::PresigningConfig::expires_in(
            std::time::Duration::from_secs(expires_seconds),
        )
        .map_err(|e| BlobStoreError::Storage(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(expires)
            .await
            .map_err(|e| BlobStoreError::Storage(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

/// Filesystem-backed blob store: keys map onto a relative path under
/// `root`, with `..` rejected as a path-escape attempt.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        if key.contains("..") {
            return Err(BlobStoreError::InvalidRef(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn presigned_url(&self, key: &str, _expires_seconds: u64) -> Result<String, BlobStoreError> {
        let path = self.resolve(key)?;
        Ok(format!("file://{}", path.display()))
    }
}

/// In-memory blob store for tests; always-compiled (not
/// `#[cfg(test)]`) so `tests/` can use it too.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        self.objects.write().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn presigned_url(&self, key: &str, _expires_seconds: u64) -> Result<String, BlobStoreError> {
        Ok(format!("memory://{key}"))
    }
}

pub fn upload_key(main_id: uuid::Uuid, filename: &str) -> String {
    format!("uploads/{main_id}/{filename}")
}

pub fn page_key(main_id: uuid::Uuid, page_number: i32) -> String {
    format!("pages/{main_id}/page_{page_number:04}.pdf")
}

pub fn result_key(main_id: uuid::Uuid) -> String {
    format!("results/{main_id}/result.md")
}

pub fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.store("a/b.txt", b"hello").await.unwrap();
        assert!(store.exists("a/b.txt").await.unwrap());
        assert_eq!(store.fetch("a/b.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn local_store_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let err = store.store("../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::InvalidRef(_)));
    }

    #[tokio::test]
    async fn in_memory_store_missing_key_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.fetch("nope").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }
}
