//! Resumable writes built from multipart uploads.
//!
//! A write at `offset` becomes one multipart upload whose first parts
//! rebuild the bytes below `offset` (copied on the server, re-read into the
//! first chunk, or zero-filled) and whose remaining parts come from the
//! source stream. The result is only published once every part is in, so a
//! failed write leaves the previous object untouched.

use std::sync::Arc;

use bytes::Bytes;
use regstore_core::{ByteStream, DriverError, DriverResult, PartialWrite};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::backend::{BackendError, BackendResult, CompletedPart, ObjectBackend};
use crate::pool::{BufferPool, PooledBuffer};

/// Writes `source` to `key` starting at `offset`.
///
/// Returns the bytes consumed from `source`, on failure too.
pub(crate) async fn write_stream<B: ObjectBackend>(
    backend: &Arc<B>,
    pool: &BufferPool,
    key: &str,
    offset: u64,
    source: ByteStream,
) -> Result<u64, PartialWrite> {
    let mut reader = SourceReader::new(source);
    let session = UploadSession::open(backend.clone(), key)
        .await
        .map_err(|err| PartialWrite::new(0, err))?;
    let mut uploader = PartUploader::new(&session);

    let mut result = fill_parts(backend.as_ref(), pool, key, offset, &mut uploader, &mut reader).await;
    let last = uploader.wait().await;
    if result.is_ok() {
        result = last;
    }
    let consumed = reader.consumed();

    if let Err(err) = result {
        session.abort().await;
        return Err(PartialWrite::new(consumed, err));
    }

    let parts = uploader.into_parts();
    if parts.is_empty() {
        // Nothing to assemble; S3 cannot complete an upload without parts.
        session.abort().await;
        backend
            .put_object(key, Bytes::new())
            .await
            .map_err(|err| PartialWrite::new(consumed, err))?;
        return Ok(consumed);
    }

    session
        .complete(parts)
        .await
        .map_err(|err| PartialWrite::new(consumed, err))?;
    Ok(consumed)
}

/// Uploads the parts for a write at `offset`, leaving at most one part in
/// flight when it returns.
async fn fill_parts<B: ObjectBackend>(
    backend: &B,
    pool: &BufferPool,
    key: &str,
    offset: u64,
    uploader: &mut PartUploader<B>,
    reader: &mut SourceReader,
) -> DriverResult<()> {
    let chunk = pool.chunk_size() as u64;
    let mut buf = pool.acquire();
    let mut pos = 0;

    if offset > 0 {
        let current = match backend.head_object(key).await {
            Ok(meta) => meta.size,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err.into()),
        };

        if offset <= current {
            if offset < chunk {
                read_prefix(backend, key, &mut buf, offset as usize).await?;
                pos = offset as usize;
            } else {
                uploader.copy(key, 0..offset).await?;
            }
        } else if current < chunk {
            read_prefix(backend, key, &mut buf, current as usize).await?;
            if offset < chunk {
                buf[current as usize..offset as usize].fill(0);
                pos = offset as usize;
            } else {
                buf[current as usize..].fill(0);
                uploader.submit(Filled::new(buf, chunk as usize)).await?;
                buf = pool.acquire();
                pos = zero_fill(uploader, pool, &mut buf, offset - chunk).await?;
            }
        } else {
            uploader.copy(key, 0..current).await?;
            pos = zero_fill(uploader, pool, &mut buf, offset - current).await?;
        }
    }

    loop {
        let read = reader.fill(&mut buf[pos..]).await?;
        let len = pos + read;
        if len == 0 {
            return Ok(());
        }
        uploader.submit(Filled::new(buf, len)).await?;
        if len < chunk as usize {
            return Ok(());
        }
        buf = pool.acquire();
        pos = 0;
    }
}

/// Copies the first `len` bytes of the current object into `buf`.
///
/// Bytes past the end of a shorter object read as zeros; a missing object
/// is an error.
async fn read_prefix<B: ObjectBackend>(
    backend: &B,
    key: &str,
    buf: &mut [u8],
    len: usize,
) -> DriverResult<()> {
    if len == 0 {
        return Ok(());
    }
    let data = match backend.get_range(key, 0, Some(len as u64)).await {
        Ok(data) => data,
        Err(err) if err.is_invalid_range() => Bytes::new(),
        Err(err) if err.is_not_found() => return Err(BackendError::not_found(key).into()),
        Err(err) => return Err(err.into()),
    };
    let n = data.len().min(len);
    buf[..n].copy_from_slice(&data[..n]);
    buf[n..len].fill(0);
    Ok(())
}

/// Uploads `gap` zero bytes: whole zero parts, then the remainder zeroed at
/// the front of `buf`. Returns the remainder length.
async fn zero_fill<B: ObjectBackend>(
    uploader: &mut PartUploader<B>,
    pool: &BufferPool,
    buf: &mut [u8],
    gap: u64,
) -> DriverResult<usize> {
    let chunk = pool.chunk_size() as u64;
    for _ in 0..gap / chunk {
        uploader.submit(pool.zeros()).await?;
    }
    let rem = (gap % chunk) as usize;
    buf[..rem].fill(0);
    Ok(rem)
}

/// An open multipart upload that is aborted unless completed.
///
/// Dropping an open session (for example when the write future is
/// cancelled) schedules the abort on the current runtime.
struct UploadSession<B: ObjectBackend> {
    backend: Arc<B>,
    key: String,
    upload_id: String,
    closed: bool,
}

impl<B: ObjectBackend> UploadSession<B> {
    async fn open(backend: Arc<B>, key: &str) -> BackendResult<Self> {
        let upload_id = backend.create_multipart_upload(key).await?;
        tracing::debug!(key, %upload_id, "opened multipart upload");
        Ok(Self {
            backend,
            key: key.to_string(),
            upload_id,
            closed: false,
        })
    }

    async fn complete(mut self, mut parts: Vec<CompletedPart>) -> BackendResult<()> {
        parts.sort_by_key(|p| p.part_number);
        let count = parts.len();
        let completed = self
            .backend
            .complete_multipart_upload(&self.key, &self.upload_id, parts)
            .await;
        match completed {
            Ok(()) => {
                self.closed = true;
                tracing::debug!(key = %self.key, parts = count, "completed multipart upload");
                Ok(())
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    async fn abort(mut self) {
        self.closed = true;
        if let Err(err) = self
            .backend
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
        {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "failed to abort multipart upload: {err}"
            );
        } else {
            tracing::debug!(key = %self.key, upload_id = %self.upload_id, "aborted multipart upload");
        }
    }
}

impl<B: ObjectBackend> Drop for UploadSession<B> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = backend.abort_multipart_upload(&key, &upload_id).await {
                        tracing::warn!(%key, %upload_id, "failed to abort dropped upload: {err}");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%key, %upload_id, "dropped multipart upload outside a runtime");
            }
        }
    }
}

/// Numbers and uploads parts, keeping at most one upload running in the
/// background while the caller fills the next buffer.
struct PartUploader<B: ObjectBackend> {
    backend: Arc<B>,
    key: String,
    upload_id: String,
    next_part: u32,
    parts: Vec<CompletedPart>,
    in_flight: Option<JoinHandle<BackendResult<CompletedPart>>>,
}

impl<B: ObjectBackend> PartUploader<B> {
    fn new(session: &UploadSession<B>) -> Self {
        Self {
            backend: session.backend.clone(),
            key: session.key.clone(),
            upload_id: session.upload_id.clone(),
            next_part: 1,
            parts: Vec::new(),
            in_flight: None,
        }
    }

    fn take_part_number(&mut self) -> u32 {
        let n = self.next_part;
        self.next_part += 1;
        n
    }

    /// Starts uploading `data` as the next part once the previous part is
    /// done.
    async fn submit<D>(&mut self, data: D) -> DriverResult<()>
    where
        D: AsRef<[u8]> + Send + Sync + 'static,
    {
        self.wait().await?;
        let part_number = self.take_part_number();
        let backend = self.backend.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();
        self.in_flight = Some(tokio::spawn(async move {
            backend
                .upload_part(&key, &upload_id, part_number, data.as_ref())
                .await
        }));
        Ok(())
    }

    /// Adds `range` of `source_key` as the next part, copied on the server.
    async fn copy(&mut self, source_key: &str, range: std::ops::Range<u64>) -> DriverResult<()> {
        self.wait().await?;
        let part_number = self.take_part_number();
        let part = self
            .backend
            .upload_part_copy(&self.key, &self.upload_id, part_number, source_key, Some(range))
            .await?;
        self.parts.push(part);
        Ok(())
    }

    /// Waits for the running part upload, if any.
    async fn wait(&mut self) -> DriverResult<()> {
        let Some(handle) = self.in_flight.take() else {
            return Ok(());
        };
        let part = handle
            .await
            .map_err(|err| BackendError::new("InternalError", format!("part upload task: {err}")))?
            .map_err(DriverError::from)?;
        self.parts.push(part);
        Ok(())
    }

    fn into_parts(mut self) -> Vec<CompletedPart> {
        std::mem::take(&mut self.parts)
    }
}

impl<B: ObjectBackend> Drop for PartUploader<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

/// The first `len` bytes of a pooled chunk.
struct Filled {
    buf: PooledBuffer,
    len: usize,
}

impl Filled {
    fn new(buf: PooledBuffer, len: usize) -> Self {
        Self { buf, len }
    }
}

impl AsRef<[u8]> for Filled {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Pulls bytes from the caller's stream and counts what was consumed.
struct SourceReader {
    inner: StreamReader<ByteStream, Bytes>,
    consumed: u64,
}

impl SourceReader {
    fn new(source: ByteStream) -> Self {
        Self {
            inner: StreamReader::new(source),
            consumed: 0,
        }
    }

    /// Reads until `buf` is full or the source ends.
    async fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            self.consumed += n as u64;
        }
        Ok(filled)
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::backend::MIN_PART_SIZE;
    use crate::memory::MemoryBackend;

    const CHUNK: usize = MIN_PART_SIZE as usize;

    fn source(data: &[u8]) -> ByteStream {
        let pieces: Vec<_> = data
            .chunks(1 << 20)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::new(stream::iter(pieces))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn write(
        backend: &Arc<MemoryBackend>,
        pool: &BufferPool,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, PartialWrite> {
        write_stream(backend, pool, "obj", offset, source(data)).await
    }

    #[tokio::test]
    async fn writes_several_chunks() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);
        let data = pattern(2 * CHUNK + 33);

        assert_eq!(write(&backend, &pool, 0, &data).await.unwrap(), data.len() as u64);
        assert_eq!(backend.get_object("obj").await.unwrap(), data);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn empty_source_creates_empty_object() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);

        assert_eq!(write(&backend, &pool, 0, &[]).await.unwrap(), 0);
        assert!(backend.get_object("obj").await.unwrap().is_empty());
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn resumes_past_a_full_chunk_with_copy() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);
        let head = pattern(CHUNK + 10);
        backend.put_object("obj", Bytes::from(head.clone())).await.unwrap();

        let consumed = write(&backend, &pool, head.len() as u64, b"tail").await.unwrap();
        assert_eq!(consumed, 4);

        let mut expected = head;
        expected.extend_from_slice(b"tail");
        assert_eq!(backend.get_object("obj").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn gap_after_large_object_is_zeroed() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);
        let head = pattern(CHUNK);
        backend.put_object("obj", Bytes::from(head.clone())).await.unwrap();

        let offset = (2 * CHUNK + 100) as u64;
        write(&backend, &pool, offset, b"xyz").await.unwrap();

        let mut expected = head;
        expected.resize(offset as usize, 0);
        expected.extend_from_slice(b"xyz");
        assert_eq!(backend.get_object("obj").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn failed_part_aborts_and_keeps_old_object() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);
        backend.put_object("obj", Bytes::from_static(b"old")).await.unwrap();
        backend.fail_parts_after(1);

        let data = pattern(3 * CHUNK);
        let err = write(&backend, &pool, 0, &data).await.unwrap_err();
        assert!(err.consumed > 0);
        assert!(matches!(err.source, DriverError::Backend { ref code, .. } if code == "InternalError"));

        assert_eq!(backend.open_uploads(), 0);
        assert_eq!(backend.aborted_uploads(), 1);
        assert_eq!(backend.get_object("obj").await.unwrap().as_ref(), b"old");
    }

    #[tokio::test]
    async fn failed_completion_aborts_and_keeps_old_object() {
        let backend = Arc::new(MemoryBackend::new("b"));
        let pool = BufferPool::new(CHUNK);
        backend.put_object("obj", Bytes::from_static(b"old")).await.unwrap();
        backend.fail_completion();

        let data = pattern(CHUNK + 7);
        let err = write(&backend, &pool, 0, &data).await.unwrap_err();
        assert_eq!(err.consumed, data.len() as u64);
        assert!(matches!(err.source, DriverError::Backend { ref code, .. } if code == "InternalError"));

        assert_eq!(backend.aborted_uploads(), 1);
        assert_eq!(backend.open_uploads(), 0);
        assert_eq!(backend.get_object("obj").await.unwrap().as_ref(), b"old");
    }

    #[tokio::test]
    async fn prefix_of_missing_object_is_not_found() {
        let backend = MemoryBackend::new("b");
        let mut buf = vec![7u8; 8];
        let err = read_prefix(&backend, "gone", &mut buf, 4).await.unwrap_err();
        assert!(matches!(err, DriverError::Backend { ref code, .. } if code == "NoSuchKey"));
    }

    #[tokio::test]
    async fn short_prefix_reads_as_zeros() {
        let backend = MemoryBackend::new("b");
        backend.put_object("short", Bytes::from_static(b"ab")).await.unwrap();
        let mut buf = vec![7u8; 8];
        read_prefix(&backend, "short", &mut buf, 4).await.unwrap();
        assert_eq!(&buf[..5], b"ab\0\0\x07");
    }

    #[tokio::test]
    async fn one_part_in_flight() {
        let backend = Arc::new(MemoryBackend::new("b").with_part_latency(Duration::from_millis(20)));
        let pool = BufferPool::new(CHUNK);
        let data = pattern(4 * CHUNK + 1);

        write(&backend, &pool, 0, &data).await.unwrap();
        assert_eq!(backend.max_concurrent_parts(), 1);
        // One buffer being filled while the other uploads.
        assert!(pool.idle() <= 2, "idle buffers: {}", pool.idle());
    }

    #[tokio::test]
    async fn cancelled_write_aborts_upload() {
        let backend = Arc::new(MemoryBackend::new("b").with_part_latency(Duration::from_millis(500)));
        let pool = BufferPool::new(CHUNK);
        let data = pattern(3 * CHUNK);

        let res = tokio::time::timeout(Duration::from_millis(50), write(&backend, &pool, 0, &data)).await;
        assert!(res.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.open_uploads(), 0);
        assert!(!backend.contains_key("obj"));
    }
}
