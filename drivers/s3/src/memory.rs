//! In-process object store with S3 semantics.
//!
//! Used to exercise the driver without a network: it enforces the minimum
//! part size, pages listings the way S3 does and reports S3 error codes.
//! A few hooks let tests inject failures and observe multipart sessions.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regstore_core::{ByteStream, UrlMethod};

use crate::backend::{
    BackendError, BackendResult, CompletedPart, LIST_MAX, ListPage, ListRequest, MIN_PART_SIZE,
    ObjectBackend, ObjectMeta,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    bucket: String,
    objects: DashMap<String, StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    page_limit: usize,
    part_latency: Option<Duration>,
    /// Part uploads left before injected failures start; `u32::MAX` disables.
    parts_until_failure: AtomicU32,
    fail_completion: AtomicBool,
    aborted: AtomicUsize,
    parts_running: Arc<AtomicUsize>,
    max_parts_running: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
            uploads: DashMap::new(),
            page_limit: LIST_MAX,
            part_latency: None,
            parts_until_failure: AtomicU32::new(u32::MAX),
            fail_completion: AtomicBool::new(false),
            aborted: AtomicUsize::new(0),
            parts_running: Arc::new(AtomicUsize::new(0)),
            max_parts_running: AtomicUsize::new(0),
        }
    }

    /// Caps listing pages below the S3 maximum.
    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.clamp(1, LIST_MAX);
        self
    }

    /// Makes every part upload take at least `latency`.
    pub fn with_part_latency(mut self, latency: Duration) -> Self {
        self.part_latency = Some(latency);
        self
    }

    /// Lets `parts` part uploads succeed, then fails every following one.
    pub fn fail_parts_after(&self, parts: u32) {
        self.parts_until_failure.store(parts, Ordering::SeqCst);
    }

    /// Fails every following completion, leaving the upload open.
    pub fn fail_completion(&self) {
        self.fail_completion.store(true, Ordering::SeqCst);
    }

    /// Multipart uploads that were opened but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn aborted_uploads(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Highest number of part uploads that were running at the same time.
    pub fn max_concurrent_parts(&self) -> usize {
        self.max_parts_running.load(Ordering::SeqCst)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    fn object(&self, key: &str) -> BackendResult<StoredObject> {
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or_else(|| BackendError::not_found(key))
    }

    fn store(&self, key: &str, data: Bytes) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
    }

    fn slice(key: &str, data: &Bytes, offset: u64, len: Option<u64>) -> BackendResult<Bytes> {
        let size = data.len() as u64;
        if offset >= size && !(offset == 0 && size == 0) {
            return Err(BackendError::invalid_range(key));
        }
        let end = match len {
            Some(len) => offset.saturating_add(len).min(size),
            None => size,
        };
        Ok(data.slice(offset as usize..end as usize))
    }

    fn no_such_upload(upload_id: &str) -> BackendError {
        BackendError::new(
            "NoSuchUpload",
            format!("the specified upload does not exist: {upload_id}"),
        )
        .with_status(404)
    }

    fn record_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendResult<CompletedPart> {
        if !(1..=10_000).contains(&part_number) {
            return Err(BackendError::new(
                "InvalidArgument",
                format!("part number must be between 1 and 10000: {part_number}"),
            )
            .with_status(400));
        }
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        if upload.key != key {
            return Err(Self::no_such_upload(upload_id));
        }
        let etag = format!("\"{}\"", blake3::hash(&data).to_hex());
        let size = data.len() as u64;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(CompletedPart {
            part_number,
            etag,
            size,
        })
    }
}

/// Tracks one running part upload for `max_concurrent_parts`.
struct RunningPart(Arc<AtomicUsize>);

impl Drop for RunningPart {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        Ok(self.object(key)?.data)
    }

    async fn get_range(&self, key: &str, offset: u64, len: Option<u64>) -> BackendResult<Bytes> {
        let object = self.object(key)?;
        Self::slice(key, &object.data, offset, len)
    }

    async fn get_stream(&self, key: &str, offset: u64) -> BackendResult<ByteStream> {
        let bytes = self.get_range(key, offset, None).await?;
        let chunk: Result<Bytes, std::io::Error> = Ok(bytes);
        let stream = futures::stream::once(futures::future::ready(chunk));
        Ok(Box::new(stream))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.store(key, data);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMeta> {
        let object = self.object(key)?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
        })
    }

    async fn list_objects(&self, request: ListRequest<'_>) -> BackendResult<ListPage> {
        // Entries are (name, is_common_prefix), in key order like S3.
        let mut entries: BTreeSet<(String, bool)> = BTreeSet::new();
        for item in self.objects.iter() {
            let key = item.key();
            let Some(rest) = key.strip_prefix(request.prefix) else {
                continue;
            };
            match request.delimiter.and_then(|d| rest.find(d).map(|i| i + d.len())) {
                Some(end) => {
                    entries.insert((format!("{}{}", request.prefix, &rest[..end]), true));
                }
                None => {
                    entries.insert((key.clone(), false));
                }
            }
        }

        let max_keys = request.max_keys.clamp(1, self.page_limit);
        let mut remaining = entries
            .into_iter()
            .filter(|(name, _)| request.marker.is_none_or(|marker| name.as_str() > marker));

        let mut page = ListPage::default();
        let mut last = None;
        for (name, is_prefix) in remaining.by_ref().take(max_keys) {
            if is_prefix {
                page.common_prefixes.push(name.clone());
            } else {
                let object = self.object(&name)?;
                page.objects.push(ObjectMeta {
                    key: name.clone(),
                    size: object.data.len() as u64,
                    last_modified: Some(object.last_modified),
                });
            }
            last = Some(name);
        }
        page.is_truncated = remaining.next().is_some();
        if page.is_truncated {
            page.next_marker = last;
        }
        Ok(page)
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> BackendResult<()> {
        let object = self.object(source_key)?;
        self.store(dest_key, object.data);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            self.objects.remove(key);
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<CompletedPart> {
        let running = self.parts_running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = RunningPart(self.parts_running.clone());
        self.max_parts_running.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.part_latency {
            tokio::time::sleep(latency).await;
        }

        let allowed = self
            .parts_until_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                u32::MAX => Some(u32::MAX),
                0 => None,
                left => Some(left - 1),
            });
        if allowed.is_err() {
            return Err(BackendError::new("InternalError", "injected part failure").with_status(500));
        }

        self.record_part(key, upload_id, part_number, Bytes::copy_from_slice(data))
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
        range: Option<Range<u64>>,
    ) -> BackendResult<CompletedPart> {
        let source = self.object(source_key)?;
        let data = match range {
            Some(range) => {
                if range.end > source.data.len() as u64 || range.start >= range.end {
                    return Err(BackendError::invalid_range(source_key));
                }
                source.data.slice(range.start as usize..range.end as usize)
            }
            None => source.data,
        };
        self.record_part(key, upload_id, part_number, data)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(BackendError::new(
                "InternalError",
                "we encountered an internal error, please try again",
            )
            .with_status(500));
        }
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        let invalid_part = |message: String| -> BackendResult<()> {
            Err(BackendError::new("InvalidPart", message).with_status(400))
        };
        if upload.key != key || parts.is_empty() {
            return invalid_part(format!("nothing to complete for {key}"));
        }

        let mut data = BytesMut::new();
        let mut previous = 0;
        for (index, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(BackendError::new(
                    "InvalidPartOrder",
                    "the list of parts was not in ascending order",
                )
                .with_status(400));
            }
            previous = part.part_number;

            let Some((etag, bytes)) = upload.parts.get(&part.part_number) else {
                return invalid_part(format!("part {} was never uploaded", part.part_number));
            };
            if *etag != part.etag {
                return invalid_part(format!("etag mismatch for part {}", part.part_number));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && (bytes.len() as u64) < MIN_PART_SIZE {
                return Err(BackendError::new(
                    "EntityTooSmall",
                    format!(
                        "part {} is {} bytes, below the minimum allowed size",
                        part.part_number,
                        bytes.len()
                    ),
                )
                .with_status(400));
            }
            data.extend_from_slice(bytes);
        }

        self.store(key, data.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> BackendResult<()> {
        self.uploads
            .remove(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn presign(
        &self,
        key: &str,
        method: UrlMethod,
        expires_in: Duration,
    ) -> BackendResult<String> {
        Ok(format!(
            "memory://{}/{}?method={}&expires={}",
            self.bucket,
            urlencoding::encode(key),
            method.as_str(),
            expires_in.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list<'a>(prefix: &'a str, delimiter: Option<&'a str>, marker: Option<&'a str>) -> ListRequest<'a> {
        ListRequest {
            prefix,
            delimiter,
            marker,
            max_keys: LIST_MAX,
        }
    }

    #[tokio::test]
    async fn small_parts_only_allowed_last() {
        let backend = MemoryBackend::new("bucket");
        let id = backend.create_multipart_upload("k").await.unwrap();
        let a = backend.upload_part("k", &id, 1, b"small").await.unwrap();
        let b = backend.upload_part("k", &id, 2, b"tail").await.unwrap();

        let err = backend
            .complete_multipart_upload("k", &id, vec![a, b])
            .await
            .unwrap_err();
        assert_eq!(err.code, "EntityTooSmall");
        assert!(!backend.contains_key("k"));
    }

    #[tokio::test]
    async fn single_short_part_completes() {
        let backend = MemoryBackend::new("bucket");
        let id = backend.create_multipart_upload("k").await.unwrap();
        let part = backend.upload_part("k", &id, 1, b"only").await.unwrap();
        backend
            .complete_multipart_upload("k", &id, vec![part])
            .await
            .unwrap();
        assert_eq!(backend.get_object("k").await.unwrap().as_ref(), b"only");
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn ranges_past_the_end_are_invalid() {
        let backend = MemoryBackend::new("bucket");
        backend.put_object("k", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(backend.get_range("k", 1, Some(1)).await.unwrap().as_ref(), b"b");
        assert!(backend.get_range("k", 3, None).await.unwrap_err().is_invalid_range());
        assert!(backend.get_range("nope", 0, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn listing_groups_common_prefixes_and_pages() {
        let backend = MemoryBackend::new("bucket").with_page_limit(2);
        for key in ["a/1", "a/2", "a/3", "a/d/x", "a/d/y", "ab"] {
            backend.put_object(key, Bytes::new()).await.unwrap();
        }

        let first = backend.list_objects(list("a/", Some("/"), None)).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a/1", "a/2"]);
        assert!(first.is_truncated);

        let second = backend
            .list_objects(list("a/", Some("/"), first.next_marker.as_deref()))
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a/3"]);
        assert_eq!(second.common_prefixes, ["a/d/"]);
        assert!(!second.is_truncated);
    }

    #[tokio::test]
    async fn injected_failures_start_after_budget() {
        let backend = MemoryBackend::new("bucket");
        backend.fail_parts_after(1);
        let id = backend.create_multipart_upload("k").await.unwrap();
        assert!(backend.upload_part("k", &id, 1, b"ok").await.is_ok());
        let err = backend.upload_part("k", &id, 2, b"no").await.unwrap_err();
        assert_eq!(err.code, "InternalError");

        backend.abort_multipart_upload("k", &id).await.unwrap();
        assert_eq!(backend.aborted_uploads(), 1);
        assert_eq!(backend.open_uploads(), 0);
    }
}
