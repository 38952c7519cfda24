//! Shared test support: an in-memory metadata store and a minimal ZIP
//! reader for verifying encoder output.

use std::{
    collections::BTreeMap,
    io::Read,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use data_model::{FileId, FileMetadata};
use flate2::read::DeflateDecoder;

use crate::metadata::MetadataStore;

/// In-memory [`MetadataStore`]. `find_by_ids` returns rows in ascending
/// id order regardless of request order, like a database lookup with no
/// ORDER BY.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    rows: Mutex<BTreeMap<FileId, FileMetadata>>,
    next_id: AtomicI64,
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, file_name: &str, file_type: &str) -> Result<FileMetadata> {
        let id = FileId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let file = FileMetadata::new(id, file_name, file_type, 0);
        self.rows.lock().unwrap().insert(id, file.clone());
        Ok(file)
    }

    async fn save(&self, mut file: FileMetadata) -> Result<FileMetadata> {
        file.updated_at = Some(Utc::now());
        self.rows.lock().unwrap().insert(file.id, file.clone());
        Ok(file)
    }

    async fn find_by_id(&self, id: FileId) -> Result<Option<FileMetadata>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileMetadata>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(_, row)| row.clone())
            .collect())
    }
}

/// One member recovered from an encoded archive.
#[derive(Debug)]
pub struct ZipArchiveEntry {
    pub name: String,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub local_header_offset: u32,
    /// Decompressed member bytes.
    pub data: Vec<u8>,
}

/// Reads an archive produced by the streaming encoder back out through
/// its central directory, cross-checking each entry's local header and
/// descriptor along the way.
pub fn parse_zip_archive(bytes: &[u8]) -> Result<Vec<ZipArchiveEntry>> {
    const EOCD_LEN: usize = 22;
    if bytes.len() < EOCD_LEN {
        bail!("archive shorter than an end-of-central-directory record");
    }
    let eocd = bytes.len() - EOCD_LEN;
    if read_u32(bytes, eocd)? != 0x0605_4b50 {
        bail!("missing end-of-central-directory signature");
    }
    let entry_count = read_u16(bytes, eocd + 10)? as usize;
    if read_u16(bytes, eocd + 8)? as usize != entry_count {
        bail!("per-disk and total entry counts disagree");
    }
    let cd_size = read_u32(bytes, eocd + 12)? as usize;
    let cd_offset = read_u32(bytes, eocd + 16)? as usize;
    if cd_offset + cd_size != eocd {
        bail!("central directory does not abut the end record");
    }

    let mut entries = Vec::with_capacity(entry_count);
    let mut pos = cd_offset;
    for _ in 0..entry_count {
        if read_u32(bytes, pos)? != 0x0201_4b50 {
            bail!("missing central directory signature at {}", pos);
        }
        let crc32 = read_u32(bytes, pos + 16)?;
        let compressed_size = read_u32(bytes, pos + 20)?;
        let uncompressed_size = read_u32(bytes, pos + 24)?;
        let name_len = read_u16(bytes, pos + 28)? as usize;
        let extra_len = read_u16(bytes, pos + 30)? as usize;
        let comment_len = read_u16(bytes, pos + 32)? as usize;
        let local_header_offset = read_u32(bytes, pos + 42)?;
        let name = String::from_utf8(bytes[pos + 46..pos + 46 + name_len].to_vec())
            .map_err(|e| anyhow!("member name is not utf-8: {:?}", e))?;
        pos += 46 + name_len + extra_len + comment_len;

        let entry = ZipArchiveEntry {
            data: read_member(
                bytes,
                local_header_offset as usize,
                &name,
                crc32,
                compressed_size,
                uncompressed_size,
            )?,
            name,
            crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Validates one member's local header and trailing descriptor, then
/// inflates its data.
fn read_member(
    bytes: &[u8],
    offset: usize,
    name: &str,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
) -> Result<Vec<u8>> {
    if read_u32(bytes, offset)? != 0x0403_4b50 {
        bail!("missing local header signature at {}", offset);
    }
    if read_u16(bytes, offset + 6)? & (1 << 3) == 0 {
        bail!("local header does not declare a data descriptor");
    }
    if read_u16(bytes, offset + 8)? != 8 {
        bail!("member {:?} is not DEFLATE-compressed", name);
    }
    let name_len = read_u16(bytes, offset + 26)? as usize;
    if &bytes[offset + 30..offset + 30 + name_len] != name.as_bytes() {
        bail!("local header name disagrees with directory name {:?}", name);
    }

    let data_start = offset + 30 + name_len;
    let data_end = data_start + compressed_size as usize;
    let mut data = Vec::with_capacity(uncompressed_size as usize);
    DeflateDecoder::new(&bytes[data_start..data_end])
        .read_to_end(&mut data)
        .map_err(|e| anyhow!("member {:?} failed to inflate: {:?}", name, e))?;
    if data.len() != uncompressed_size as usize {
        bail!("member {:?} inflated to an unexpected size", name);
    }

    if read_u32(bytes, data_end)? != 0x0807_4b50 {
        bail!("missing data descriptor after member {:?}", name);
    }
    if read_u32(bytes, data_end + 4)? != crc32 {
        bail!("descriptor crc disagrees with directory crc for {:?}", name);
    }
    Ok(data)
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    let slice = bytes
        .get(at..at + 2)
        .ok_or_else(|| anyhow!("archive truncated at {}", at))?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("archive truncated at {}", at))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
