pub mod test_objects;

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of a file's metadata row. The raw integer is embedded in
/// storage keys, so `Display` renders it bare.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct FileId(i64);

impl FileId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One stored file's metadata row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub id: FileId,
    pub file_name: String,
    /// MIME type reported at upload time.
    pub file_type: String,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FileMetadata {
    pub fn new(id: FileId, file_name: &str, file_type: &str, size_bytes: u64) -> Self {
        Self {
            id,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            size_bytes,
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }

    /// Object key under which this file's bytes live in the blob store.
    pub fn storage_key(&self) -> String {
        FileMetadata::storage_key_from(self.id, &self.file_name)
    }

    pub fn storage_key_from(id: FileId, file_name: &str) -> String {
        format!("{}-{}", id, file_name)
    }
}

#[cfg(test)]
mod tests {
    use crate::{FileId, FileMetadata};

    #[test]
    fn test_storage_key_embeds_id_and_name() {
        let file = FileMetadata::new(FileId::new(42), "report.pdf", "application/pdf", 0);
        assert_eq!(file.storage_key(), "42-report.pdf");
        assert_eq!(
            FileMetadata::storage_key_from(FileId::new(7), "a b.txt"),
            "7-a b.txt"
        );
    }
}
