pub mod multipart;

use std::{env, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3Builder,
    local::LocalFileSystem,
    memory::InMemory,
    multipart::MultipartStore,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use url::Url;

pub use crate::multipart::{StreamingMultipartUpload, UploadResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
}

impl BlobStorageConfig {
    /// `url` selects the backend: `s3://bucket/prefix`, `file:///dir`, or
    /// `memory:///`.
    pub fn new(url: &str) -> Self {
        BlobStorageConfig {
            path: Some(url.to_string()),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap()
                .join("filepack_storage/blobs")
                .to_str()
                .unwrap()
        );
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
        }
    }
}

/// Result of a whole-object put, with the digest computed while the bytes
/// streamed through.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Read-side contract for components that stream stored blobs.
#[async_trait]
pub trait BlobReader: Send + Sync {
    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>>;
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    multipart_store: Arc<dyn MultipartStore>,
    path: Path,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .ok_or_else(|| anyhow!("blob store path is not configured"))?;
        let (object_store, multipart_store, path) = Self::build_object_store(&url)?;
        Ok(Self {
            object_store,
            multipart_store,
            path,
        })
    }

    fn build_object_store(
        url_str: &str,
    ) -> Result<(Arc<dyn ObjectStore>, Arc<dyn MultipartStore>, Path)> {
        let url = url_str.parse::<Url>()?;
        let (scheme, path) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let mut builder = AmazonS3Builder::from_env().with_url(url_str);
                // For supporting localstack/minio for testing
                if let Ok(val) = env::var("AWS_ENDPOINT_URL") {
                    builder = builder.with_endpoint(val.clone());
                    if val.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                }
                Ok(Self::erase_store(builder.build()?, path))
            }
            ObjectStoreScheme::Local => Ok(Self::erase_store(LocalFileSystem::new(), path)),
            ObjectStoreScheme::Memory => Ok(Self::erase_store(InMemory::new(), path)),
            _ => Err(anyhow!("unsupported object store url: {:?}", url_str)),
        }
    }

    fn erase_store<T: ObjectStore + MultipartStore + 'static>(
        store: T,
        path: Path,
    ) -> (Arc<dyn ObjectStore>, Arc<dyn MultipartStore>, Path) {
        let store = Arc::new(store);
        let object_store: Arc<dyn ObjectStore> = store.clone();
        let multipart_store: Arc<dyn MultipartStore> = store;
        (object_store, multipart_store, path)
    }

    /// Streams `data` into the store under `key` with the store's own
    /// multipart writer, hashing as the bytes pass through. Suited to
    /// payloads produced in-process; inbound request bodies go through
    /// [`put_streamed`](Self::put_streamed) instead.
    pub async fn put(
        &self,
        key: &str,
        mut data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult> {
        let mut hasher = Sha256::new();
        let path = self.path.child(key);
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = data.next().await {
            w.wait_for_capacity(1).await?;
            let chunk = chunk?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;

        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
            sha256_hash: format!("{:x}", hasher.finalize()),
        })
    }

    /// Persists an unbounded inbound stream under `key` through an
    /// explicit multipart session with abort-on-failure semantics. See
    /// [`StreamingMultipartUpload`].
    pub async fn put_streamed(
        &self,
        key: &str,
        data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<UploadResult> {
        let path = self.path.child(key);
        StreamingMultipartUpload::new(self.multipart_store.clone(), path)
            .run(data)
            .await
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = self.path.child(key);
        let get_result = self
            .object_store
            .get(&path)
            .await
            .map_err(|e| anyhow!("can't get object {:?}: {:?}", path, e))?;
        let stream = get_result
            .into_stream()
            .map_err(move |e| anyhow!("error reading object {:?}: {:?}", path, e));
        Ok(Box::pin(stream))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.path.child(key)).await?;
        Ok(())
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }
}

#[async_trait]
impl BlobReader for BlobStorage {
    async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        BlobStorage::get(self, key).await
    }
}
