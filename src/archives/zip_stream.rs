//! Streaming ZIP encoder.
//!
//! Each member is emitted as local header, then DEFLATE windows, then a
//! data descriptor, so no already-written bytes ever need patching: CRC
//! and sizes are only written once known, in the trailing descriptor
//! (general-purpose flag bit 3). The central directory is assembled after
//! the last member from metadata accumulated while streaming, with local
//! header offsets recomputed in emission order.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use blob_store::BlobReader;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, Timelike};
use crc32fast::Hasher;
use flate2::{Compress, Compression, FlushCompress, Status};
use futures::{stream::BoxStream, StreamExt};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

/// Version 2.0: DEFLATE with data descriptors.
const ZIP_VERSION: u16 = 20;
/// General-purpose flag bit 3: CRC and sizes follow the data.
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Compression method 8, DEFLATE.
const METHOD_DEFLATE: u16 = 8;

/// Output window handed to the compressor.
const DEFLATE_CHUNK_SIZE: usize = 8192;

const LOCAL_HEADER_LEN: u64 = 30;
const DATA_DESCRIPTOR_LEN: u64 = 16;

/// Per-member metadata accumulated while its bytes stream through. The
/// offset is assigned exactly once, during directory construction.
struct ZipEntryMeta {
    name_bytes: Vec<u8>,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
}

impl ZipEntryMeta {
    /// Bytes this entry occupies in the archive: header + name + data +
    /// descriptor.
    fn framed_size(&self) -> u64 {
        LOCAL_HEADER_LEN + self.name_bytes.len() as u64 + self.compressed_size + DATA_DESCRIPTOR_LEN
    }
}

/// Lazily encodes the blobs named by `keys`, in order, as one ZIP byte
/// stream. Each key is both the blob lookup key and the member name.
///
/// The stream is finite and single-use. A failed blob read terminates it
/// with that error; no directory records are produced after a failure, so
/// a truncated archive is never passed off as complete.
pub fn zip_stream(
    reader: Arc<dyn BlobReader>,
    keys: Vec<String>,
) -> BoxStream<'static, Result<Bytes>> {
    let stream = try_stream! {
        let timestamp = DosTimestamp::now();
        let mut entries: Vec<ZipEntryMeta> = Vec::with_capacity(keys.len());

        for key in keys {
            let name_bytes = key.clone().into_bytes();
            if name_bytes.len() > u16::MAX as usize {
                Err(anyhow!(
                    "member name {:?} is {} bytes, over the zip field limit of {}",
                    key,
                    name_bytes.len(),
                    u16::MAX
                ))?;
            }

            yield local_header(&name_bytes, timestamp);

            let mut crc = Hasher::new();
            let mut deflater = Compress::new(Compression::default(), false);
            let mut uncompressed_size: u64 = 0;

            let mut blob = reader.get(&key).await?;
            while let Some(chunk) = blob.next().await {
                let chunk = chunk?;
                crc.update(&chunk);
                uncompressed_size += chunk.len() as u64;
                for window in deflate_chunk(&mut deflater, &chunk)? {
                    yield window;
                }
            }
            for window in deflate_finish(&mut deflater)? {
                yield window;
            }

            let entry = ZipEntryMeta {
                name_bytes,
                crc32: crc.finalize(),
                compressed_size: deflater.total_out(),
                uncompressed_size,
                local_header_offset: 0,
            };
            yield data_descriptor(&entry);
            entries.push(entry);
        }

        yield central_directory(&mut entries, timestamp);
    };
    Box::pin(stream)
}

/// Runs one source chunk through the compressor and sync-flushes it, so
/// downstream sees the chunk's bytes without waiting for internal buffers
/// to fill on a slow source.
fn deflate_chunk(deflater: &mut Compress, input: &[u8]) -> Result<Vec<Bytes>> {
    let mut windows = Vec::new();
    let mut consumed = 0;
    while consumed < input.len() {
        let before_in = deflater.total_in();
        let before_out = deflater.total_out();
        let mut window = vec![0u8; DEFLATE_CHUNK_SIZE];
        deflater
            .compress(&input[consumed..], &mut window, FlushCompress::None)
            .map_err(|e| anyhow!("deflate failed: {:?}", e))?;
        consumed += (deflater.total_in() - before_in) as usize;
        push_window(&mut windows, window, (deflater.total_out() - before_out) as usize);
    }
    loop {
        let before_out = deflater.total_out();
        let mut window = vec![0u8; DEFLATE_CHUNK_SIZE];
        deflater
            .compress(&[], &mut window, FlushCompress::Sync)
            .map_err(|e| anyhow!("deflate sync flush failed: {:?}", e))?;
        let produced = (deflater.total_out() - before_out) as usize;
        push_window(&mut windows, window, produced);
        if produced < DEFLATE_CHUNK_SIZE {
            break;
        }
    }
    Ok(windows)
}

/// Finalizes the member's DEFLATE bitstream.
fn deflate_finish(deflater: &mut Compress) -> Result<Vec<Bytes>> {
    let mut windows = Vec::new();
    loop {
        let before_out = deflater.total_out();
        let mut window = vec![0u8; DEFLATE_CHUNK_SIZE];
        let status = deflater
            .compress(&[], &mut window, FlushCompress::Finish)
            .map_err(|e| anyhow!("deflate finish failed: {:?}", e))?;
        push_window(&mut windows, window, (deflater.total_out() - before_out) as usize);
        if status == Status::StreamEnd {
            break;
        }
    }
    Ok(windows)
}

fn push_window(windows: &mut Vec<Bytes>, mut window: Vec<u8>, produced: usize) {
    if produced > 0 {
        window.truncate(produced);
        windows.push(window.into());
    }
}

fn local_header(name_bytes: &[u8], timestamp: DosTimestamp) -> Bytes {
    let mut buf = BytesMut::with_capacity(LOCAL_HEADER_LEN as usize + name_bytes.len());
    buf.put_u32_le(LOCAL_HEADER_SIGNATURE);
    buf.put_u16_le(ZIP_VERSION);
    buf.put_u16_le(FLAG_DATA_DESCRIPTOR);
    buf.put_u16_le(METHOD_DEFLATE);
    buf.put_u16_le(timestamp.time);
    buf.put_u16_le(timestamp.date);
    buf.put_u32_le(0); // crc, in the descriptor instead
    buf.put_u32_le(0); // compressed size, ditto
    buf.put_u32_le(0); // uncompressed size, ditto
    buf.put_u16_le(name_bytes.len() as u16);
    buf.put_u16_le(0); // extra field length
    buf.put_slice(name_bytes);
    buf.freeze()
}

fn data_descriptor(entry: &ZipEntryMeta) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_DESCRIPTOR_LEN as usize);
    buf.put_u32_le(DATA_DESCRIPTOR_SIGNATURE);
    buf.put_u32_le(entry.crc32);
    buf.put_u32_le(entry.compressed_size as u32);
    buf.put_u32_le(entry.uncompressed_size as u32);
    buf.freeze()
}

/// Builds the central directory plus end record. Offsets are assigned
/// here by walking the entries in emission order and summing framed
/// sizes, independent of when each entry's metadata was recorded.
fn central_directory(entries: &mut [ZipEntryMeta], timestamp: DosTimestamp) -> Bytes {
    let mut offset: u64 = 0;
    for entry in entries.iter_mut() {
        entry.local_header_offset = offset;
        offset += entry.framed_size();
    }
    let central_directory_start = offset;

    let mut buf = BytesMut::new();
    for entry in entries.iter() {
        buf.put_u32_le(CENTRAL_DIRECTORY_SIGNATURE);
        buf.put_u16_le(ZIP_VERSION); // version made by
        buf.put_u16_le(ZIP_VERSION); // version needed to extract
        buf.put_u16_le(FLAG_DATA_DESCRIPTOR);
        buf.put_u16_le(METHOD_DEFLATE);
        buf.put_u16_le(timestamp.time);
        buf.put_u16_le(timestamp.date);
        buf.put_u32_le(entry.crc32);
        buf.put_u32_le(entry.compressed_size as u32);
        buf.put_u32_le(entry.uncompressed_size as u32);
        buf.put_u16_le(entry.name_bytes.len() as u16);
        buf.put_u16_le(0); // extra field length
        buf.put_u16_le(0); // comment length
        buf.put_u16_le(0); // disk number start
        buf.put_u16_le(0); // internal attributes
        buf.put_u32_le(0); // external attributes
        buf.put_u32_le(entry.local_header_offset as u32);
        buf.put_slice(&entry.name_bytes);
    }
    let central_directory_size = buf.len() as u32;

    buf.put_u32_le(END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    buf.put_u16_le(0); // disk number
    buf.put_u16_le(0); // directory start disk
    buf.put_u16_le(entries.len() as u16); // entries on this disk
    buf.put_u16_le(entries.len() as u16); // entries total
    buf.put_u32_le(central_directory_size);
    buf.put_u32_le(central_directory_start as u32);
    buf.put_u16_le(0); // comment length
    buf.freeze()
}

/// Generation time in the legacy DOS encoding, stamped on every entry of
/// one archive build.
#[derive(Debug, Clone, Copy)]
struct DosTimestamp {
    date: u16,
    time: u16,
}

impl DosTimestamp {
    fn now() -> Self {
        let now = Local::now();
        let date = (((now.year() - 1980) as u16) << 9)
            | ((now.month() as u16) << 5)
            | now.day() as u16;
        let time = ((now.hour() as u16) << 11)
            | ((now.minute() as u16) << 5)
            | (now.second() as u16 / 2);
        DosTimestamp { date, time }
    }
}
