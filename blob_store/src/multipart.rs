//! Chunked multipart upload of unbounded byte streams.
//!
//! Inbound bytes are buffered until a part-size threshold is reached (or a
//! flush window elapses), then uploaded strictly in order as numbered
//! parts of one multipart session. The session is completed with a
//! manifest sorted by part number, and aborted best-effort on any failure
//! so the store does not accrue orphaned parts.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use object_store::{
    multipart::{MultipartStore, PartId},
    path::Path,
    MultipartId,
    PutPayload,
};
use tokio::{runtime::Handle, time::timeout};
use tracing::{debug, warn};

/// S3-compatible stores reject non-final parts below 5 MiB.
pub const PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Buffered bytes are flushed as an (undersized) part if the source
/// produces nothing for this long, so low-throughput producers still make
/// progress.
pub const PART_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Store-assigned identifier of the finalized object plus the total byte
/// count observed while streaming.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub e_tag: Option<String>,
    pub version: Option<String>,
    pub size_bytes: u64,
}

/// One uploaded chunk of a session, in emission order.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub part_number: usize,
    pub part_id: PartId,
}

/// State of a single in-flight upload. Every counter and buffer is owned
/// by this instance; concurrent uploads each run their own.
pub struct StreamingMultipartUpload {
    store: Arc<dyn MultipartStore>,
    path: Path,
    buffer: VecDeque<Bytes>,
    buffered_bytes: usize,
    parts: Vec<UploadPart>,
    next_part_number: usize,
    total_bytes: u64,
}

impl StreamingMultipartUpload {
    pub fn new(store: Arc<dyn MultipartStore>, path: Path) -> Self {
        Self {
            store,
            path,
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            parts: Vec::new(),
            next_part_number: 1,
            total_bytes: 0,
        }
    }

    /// Drains `data` into the store. Exactly one session is created; on
    /// success it is completed with every uploaded part, on failure it is
    /// aborted before the error propagates. Dropping the returned future
    /// mid-flight also aborts the session, via a guard that spawns the
    /// abort call on the current runtime.
    pub async fn run(
        mut self,
        data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<UploadResult> {
        let session = self.store.create_multipart(&self.path).await?;
        let mut guard = AbortGuard::new(self.store.clone(), self.path.clone(), session.clone());
        match self.drive(&session, data).await {
            Ok(result) => {
                guard.disarm();
                Ok(result)
            }
            Err(e) => {
                guard.disarm();
                if let Err(abort_err) = self.store.abort_multipart(&self.path, &session).await {
                    warn!(
                        "failed to abort multipart session {:?} for {:?}: {:?}",
                        session, self.path, abort_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        session: &MultipartId,
        mut data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<UploadResult> {
        loop {
            match timeout(PART_FLUSH_TIMEOUT, data.next()).await {
                Ok(Some(chunk)) => {
                    let chunk = chunk?;
                    self.total_bytes += chunk.len() as u64;
                    self.buffered_bytes += chunk.len();
                    self.buffer.push_back(chunk);
                    while self.buffered_bytes >= PART_SIZE_BYTES {
                        let payload = self.carve(PART_SIZE_BYTES);
                        self.upload_part(session, payload).await?;
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    if self.buffered_bytes > 0 {
                        let payload = self.carve(self.buffered_bytes);
                        self.upload_part(session, payload).await?;
                    }
                }
            }
        }
        if self.buffered_bytes > 0 {
            let payload = self.carve(self.buffered_bytes);
            self.upload_part(session, payload).await?;
        }

        // In-order uploading already produces an ascending manifest; the
        // sort is a safety net should parts ever be produced out of order.
        self.parts.sort_by_key(|p| p.part_number);
        let parts = self.parts.drain(..).map(|p| p.part_id).collect();
        let completed = self
            .store
            .complete_multipart(&self.path, session, parts)
            .await?;
        Ok(UploadResult {
            e_tag: completed.e_tag,
            version: completed.version,
            size_bytes: self.total_bytes,
        })
    }

    /// Splits exactly `len` bytes off the front of the buffer without
    /// copying payload data.
    fn carve(&mut self, len: usize) -> PutPayload {
        let mut taken = 0;
        let mut out = Vec::new();
        while taken < len {
            let mut front = self
                .buffer
                .pop_front()
                .expect("buffered_bytes out of sync with buffer");
            let remaining = len - taken;
            if front.len() > remaining {
                out.push(front.split_to(remaining));
                self.buffer.push_front(front);
                taken = len;
            } else {
                taken += front.len();
                out.push(front);
            }
        }
        self.buffered_bytes -= len;
        out.into_iter().collect()
    }

    async fn upload_part(&mut self, session: &MultipartId, payload: PutPayload) -> Result<()> {
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        let size = payload.content_length();
        let part_id = self
            .store
            .put_part(&self.path, session, part_number - 1, payload)
            .await
            .map_err(|e| {
                anyhow!(
                    "failed to upload part {} of {:?}: {:?}",
                    part_number,
                    self.path,
                    e
                )
            })?;
        debug!("uploaded part {} ({} bytes)", part_number, size);
        self.parts.push(UploadPart {
            part_number,
            part_id,
        });
        Ok(())
    }
}

/// Aborts the session if the owning upload future is dropped before it
/// resolves; the explicit error path in [`StreamingMultipartUpload::run`]
/// disarms it first and aborts inline.
struct AbortGuard {
    store: Arc<dyn MultipartStore>,
    path: Path,
    session: MultipartId,
    armed: bool,
}

impl AbortGuard {
    fn new(store: Arc<dyn MultipartStore>, path: Path, session: MultipartId) -> Self {
        Self {
            store,
            path,
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let path = self.path.clone();
        let session = self.session.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.abort_multipart(&path, &session).await {
                    warn!(
                        "failed to abort multipart session {:?} for {:?}: {:?}",
                        session, path, e
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use object_store::{memory::InMemory, ObjectStore};

    use super::*;

    #[derive(Default)]
    struct Calls {
        creates: usize,
        part_sizes: Vec<usize>,
        completes: usize,
        aborts: usize,
        aborted_sessions: Vec<MultipartId>,
    }

    /// Delegates to an in-memory store while recording every call, with
    /// optional failure injection.
    struct RecordingStore {
        inner: InMemory,
        calls: Mutex<Calls>,
        fail_part_after: Option<usize>,
        fail_complete: bool,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: InMemory::new(),
                calls: Mutex::new(Calls::default()),
                fail_part_after: None,
                fail_complete: false,
            }
        }

        fn injected() -> object_store::Error {
            object_store::Error::Generic {
                store: "recording",
                source: "injected failure".to_string().into(),
            }
        }
    }

    #[async_trait::async_trait]
    impl MultipartStore for RecordingStore {
        async fn create_multipart(&self, path: &Path) -> object_store::Result<MultipartId> {
            self.calls.lock().unwrap().creates += 1;
            self.inner.create_multipart(path).await
        }

        async fn put_part(
            &self,
            path: &Path,
            id: &MultipartId,
            part_idx: usize,
            payload: PutPayload,
        ) -> object_store::Result<PartId> {
            let uploaded_so_far = {
                let mut calls = self.calls.lock().unwrap();
                calls.part_sizes.push(payload.content_length());
                calls.part_sizes.len() - 1
            };
            if let Some(n) = self.fail_part_after {
                if uploaded_so_far >= n {
                    return Err(Self::injected());
                }
            }
            self.inner.put_part(path, id, part_idx, payload).await
        }

        async fn complete_multipart(
            &self,
            path: &Path,
            id: &MultipartId,
            parts: Vec<PartId>,
        ) -> object_store::Result<object_store::PutResult> {
            self.calls.lock().unwrap().completes += 1;
            if self.fail_complete {
                return Err(Self::injected());
            }
            self.inner.complete_multipart(path, id, parts).await
        }

        async fn abort_multipart(
            &self,
            path: &Path,
            id: &MultipartId,
        ) -> object_store::Result<()> {
            {
                let mut calls = self.calls.lock().unwrap();
                calls.aborts += 1;
                calls.aborted_sessions.push(id.clone());
            }
            self.inner.abort_multipart(path, id).await
        }
    }

    fn source(chunks: Vec<Bytes>) -> impl Stream<Item = Result<Bytes>> + Send + Unpin {
        stream::iter(chunks.into_iter().map(Ok).collect::<Vec<_>>())
    }

    async fn read_back(store: &InMemory, path: &Path) -> Vec<u8> {
        store.get(path).await.unwrap().bytes().await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_exact_multiple_of_part_size() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("two-parts.bin");
        let data: Vec<u8> = (0..PART_SIZE_BYTES * 2).map(|i| (i % 251) as u8).collect();
        // Deliver in chunk sizes that straddle the part boundary.
        let chunks = data
            .chunks(1_000_003)
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(chunks))
            .await
            .unwrap();

        assert_eq!(result.size_bytes, (PART_SIZE_BYTES * 2) as u64);
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.part_sizes, vec![PART_SIZE_BYTES, PART_SIZE_BYTES]);
        assert_eq!(calls.creates, 1);
        assert_eq!(calls.completes, 1);
        assert_eq!(calls.aborts, 0);
        drop(calls);

        assert_eq!(read_back(&store.inner, &path).await, data);
    }

    #[tokio::test]
    async fn test_one_byte_over_threshold_makes_two_parts() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("straddle.bin");
        let data = Bytes::from(vec![7u8; PART_SIZE_BYTES + 1]);

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(vec![data]))
            .await
            .unwrap();

        assert_eq!(result.size_bytes, (PART_SIZE_BYTES + 1) as u64);
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.part_sizes, vec![PART_SIZE_BYTES, 1]);
    }

    #[tokio::test]
    async fn test_single_undersized_part() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("small.bin");

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(vec![Bytes::from_static(b"tiny")]))
            .await
            .unwrap();

        assert_eq!(result.size_bytes, 4);
        assert_eq!(store.calls.lock().unwrap().part_sizes, vec![4]);
        assert_eq!(read_back(&store.inner, &path).await, b"tiny");
    }

    #[tokio::test]
    async fn test_empty_stream_finalizes_cleanly() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("empty.bin");

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(vec![]))
            .await
            .unwrap();

        assert_eq!(result.size_bytes, 0);
        let calls = store.calls.lock().unwrap();
        assert!(calls.part_sizes.is_empty());
        assert_eq!(calls.creates, 1);
        assert_eq!(calls.completes, 1);
        assert_eq!(calls.aborts, 0);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_session_once() {
        let mut store = RecordingStore::new();
        store.fail_part_after = Some(1);
        let store = Arc::new(store);
        let path = Path::from("doomed.bin");
        let data = Bytes::from(vec![1u8; PART_SIZE_BYTES * 3]);

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(vec![data]))
            .await;

        assert!(result.is_err());
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.creates, 1);
        assert_eq!(calls.completes, 0);
        assert_eq!(calls.aborts, 1);
        assert_eq!(calls.aborted_sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_source_error_aborts_session() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("broken-source.bin");
        let data = stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(anyhow!("connection reset")),
        ]);

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(data)
            .await;

        assert!(result.is_err());
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.completes, 0);
        assert_eq!(calls.aborts, 1);
    }

    #[tokio::test]
    async fn test_complete_failure_aborts_session() {
        let mut store = RecordingStore::new();
        store.fail_complete = true;
        let store = Arc::new(store);
        let path = Path::from("unfinishable.bin");

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(source(vec![Bytes::from_static(b"data")]))
            .await;

        assert!(result.is_err());
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.completes, 1);
        assert_eq!(calls.aborts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timeout_uploads_undersized_part() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("trickle.bin");
        let data = Box::pin(async_stream::stream! {
            yield Ok::<_, anyhow::Error>(Bytes::from_static(b"abc"));
            // Stall well past the flush window before ending the stream.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = StreamingMultipartUpload::new(store.clone(), path.clone())
            .run(data)
            .await
            .unwrap();

        assert_eq!(result.size_bytes, 3);
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.part_sizes, vec![3]);
        assert_eq!(calls.completes, 1);
        drop(calls);
        assert_eq!(read_back(&store.inner, &path).await, b"abc");
    }

    #[tokio::test]
    async fn test_dropped_upload_aborts_session() {
        let store = Arc::new(RecordingStore::new());
        let path = Path::from("cancelled.bin");
        // A source that never produces, so the upload parks after opening
        // its session.
        let pending = stream::pending::<Result<Bytes>>();

        let mut upload = Box::pin(
            StreamingMultipartUpload::new(store.clone(), path.clone()).run(pending),
        );
        // Poll once so the session gets created, then drop the future.
        futures::future::poll_immediate(upload.as_mut()).await;
        assert_eq!(store.calls.lock().unwrap().creates, 1);
        drop(upload);

        // The abort runs on a spawned task; yield until it lands.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if store.calls.lock().unwrap().aborts == 1 {
                break;
            }
        }
        assert_eq!(store.calls.lock().unwrap().aborts, 1);
    }
}
