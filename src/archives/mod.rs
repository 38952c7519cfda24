mod zip_stream;

pub use zip_stream::zip_stream;

use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobReader;
use bytes::Bytes;
use data_model::FileId;
use futures::stream::BoxStream;
use tracing::info;

use crate::metadata::MetadataStore;

/// Serves stored blobs as a single streamed ZIP archive.
pub struct ArchiveService {
    blob_reader: Arc<dyn BlobReader>,
    metadata: Arc<dyn MetadataStore>,
}

impl ArchiveService {
    pub fn new(blob_reader: Arc<dyn BlobReader>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            blob_reader,
            metadata,
        }
    }

    /// Resolves `ids` to their storage keys and returns the archive byte
    /// stream.
    ///
    /// Member order follows the metadata lookup's result order, not the
    /// order of `ids`. Ids without a metadata row are skipped.
    pub async fn zip_stream_from_ids(
        &self,
        ids: &[FileId],
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let keys = self
            .metadata
            .find_by_ids(ids)
            .await?
            .iter()
            .map(|file| file.storage_key())
            .collect::<Vec<_>>();
        info!(
            "building zip archive for {} of {} requested files",
            keys.len(),
            ids.len()
        );
        Ok(self.zip_stream(keys))
    }

    /// Archive byte stream for blobs already addressed by object key, in
    /// the given order.
    pub fn zip_stream(&self, keys: Vec<String>) -> BoxStream<'static, Result<Bytes>> {
        zip_stream(self.blob_reader.clone(), keys)
    }
}
