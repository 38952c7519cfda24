use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStorage;
use bytes::Bytes;
use data_model::{FileId, FileMetadata};
use futures::{stream::BoxStream, Stream};
use tracing::info;

use crate::metadata::MetadataStore;

/// A stored file ready to stream back to a client.
pub struct DownloadResult {
    pub file_name: String,
    pub file_type: String,
    pub content: BoxStream<'static, Result<Bytes>>,
}

/// Upload and download orchestration over the metadata and blob stores.
pub struct FileService {
    metadata: Arc<dyn MetadataStore>,
    blob_storage: Arc<BlobStorage>,
}

impl FileService {
    pub fn new(metadata: Arc<dyn MetadataStore>, blob_storage: Arc<BlobStorage>) -> Self {
        Self {
            metadata,
            blob_storage,
        }
    }

    /// Streams `content` into the blob store under a freshly assigned
    /// `"{id}-{name}"` key, then persists the observed size.
    pub async fn upload_file(
        &self,
        file_name: &str,
        file_type: &str,
        content: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<FileMetadata> {
        let mut file = self.metadata.create(file_name, file_type).await?;
        let key = file.storage_key();
        let uploaded = self.blob_storage.put_streamed(&key, content).await?;
        info!("uploaded {:?} ({} bytes)", key, uploaded.size_bytes);
        file.size_bytes = uploaded.size_bytes;
        self.metadata.save(file).await
    }

    /// Streams the file's bytes back with its stored name and MIME type,
    /// or `None` when `id` has no metadata row.
    pub async fn download_file(&self, id: FileId) -> Result<Option<DownloadResult>> {
        let Some(file) = self.metadata.find_by_id(id).await? else {
            return Ok(None);
        };
        let content = self.blob_storage.get(&file.storage_key()).await?;
        Ok(Some(DownloadResult {
            file_name: file.file_name,
            file_type: file.file_type,
            content,
        }))
    }
}
