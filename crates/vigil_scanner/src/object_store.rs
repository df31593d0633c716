//! The object-storage boundary.
//!
//! The core only needs one operation: stream an object to a local file while
//! computing its SHA-256. Real bucket-client wiring lives outside; the
//! filesystem store backs tests and standalone deployments, and the HTTP
//! store covers any gateway exposing `GET {endpoint}/{bucket}/{object}`.

use crate::error::FetchError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Hex SHA-256 of the object bytes, computed in stream.
    pub sha256: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `bucket/object` into `dest`, returning the streamed digest.
    async fn fetch(&self, bucket: &str, object: &str, dest: &Path)
        -> Result<ObjectMeta, FetchError>;
}

/// Objects rooted in a local directory: `{root}/{bucket}/{object}`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<ObjectMeta, FetchError> {
        let source = self.root.join(bucket).join(object);
        let mut reader = tokio::fs::File::open(&source).await.map_err(|err| {
            FetchError::Object(format!("{}/{}: {}", bucket, object, err))
        })?;
        let mut writer = tokio::fs::File::create(dest).await?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = tokio::io::AsyncReadExt::read(&mut reader, &mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer.write_all(&buffer[..read]).await?;
            size += read as u64;
        }
        writer.flush().await?;

        let sha256 = hex::encode(hasher.finalize());
        debug!("Fetched {}/{} ({} bytes)", bucket, object, size);
        Ok(ObjectMeta { sha256, size })
    }
}

/// Objects served over HTTP: `GET {endpoint}/{bucket}/{object}`.
pub struct HttpObjectStore {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<ObjectMeta, FetchError> {
        let url = format!("{}/{}/{}", self.endpoint, bucket, object);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| FetchError::Object(format!("{}: {}", url, err)))?;

        let mut writer = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::Object(format!("{}: {}", url, err)))?
        {
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        writer.flush().await?;

        let sha256 = hex::encode(hasher.finalize());
        debug!("Fetched {} ({} bytes)", url, size);
        Ok(ObjectMeta { sha256, size })
    }
}
