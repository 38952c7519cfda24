pub mod tests {
    use crate::{FileId, FileMetadata};

    pub const TEST_FILE_TYPE: &str = "application/octet-stream";

    pub fn test_file_metadata(id: i64, file_name: &str, size_bytes: u64) -> FileMetadata {
        FileMetadata::new(FileId::new(id), file_name, TEST_FILE_TYPE, size_bytes)
    }
}
