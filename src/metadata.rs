//! Metadata lookup contract: the narrow store interface the file and
//! archive services resolve ids through. Behavior lives in the concrete
//! implementations (see the in-memory store in [`crate::testing`]).

use anyhow::Result;
use async_trait::async_trait;
use data_model::{FileId, FileMetadata};

/// Persistence contract for file metadata rows.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Allocates a new metadata row for an upload and returns it.
    async fn create(&self, file_name: &str, file_type: &str) -> Result<FileMetadata>;

    /// Persists an updated metadata row and returns the stored value.
    async fn save(&self, file: FileMetadata) -> Result<FileMetadata>;

    /// Looks up a single row by id, or `None` when it does not exist.
    async fn find_by_id(&self, id: FileId) -> Result<Option<FileMetadata>>;

    /// Looks up every row whose id is in `ids`. Result order is the
    /// store's own, not the order of `ids`; missing ids are omitted.
    async fn find_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileMetadata>>;
}
