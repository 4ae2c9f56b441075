//! The object-store capability surface the driver is built on.
//!
//! Each `ObjectBackend` method is one request against
//! the remote store. Everything that needs more than one request (resumable
//! writes, recursive deletes, paginated listings) lives in the driver.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regstore_core::{ByteStream, DriverError, UrlMethod};
use thiserror::Error;

/// S3 requires every multipart part except the last to be at least this big.
pub const MIN_PART_SIZE: u64 = 5 << 20;

/// S3 rejects parts above this size.
pub const MAX_PART_SIZE: u64 = 5 << 30;

/// Largest number of keys S3 returns from one list request.
pub const LIST_MAX: usize = 1000;

pub type BackendResult<T, E = BackendError> = std::result::Result<T, E>;

/// Failure reported by the object store, with its error code preserved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn not_found(key: &str) -> Self {
        Self::new("NoSuchKey", format!("the specified key does not exist: {key}")).with_status(404)
    }

    pub fn invalid_range(key: &str) -> Self {
        Self::new("InvalidRange", format!("the requested range is not satisfiable: {key}"))
            .with_status(416)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || matches!(self.code.as_str(), "NoSuchKey" | "NotFound")
    }

    pub fn is_invalid_range(&self) -> bool {
        self.status == Some(416) || self.code == "InvalidRange"
    }
}

impl From<BackendError> for DriverError {
    fn from(err: BackendError) -> Self {
        DriverError::Backend {
            code: err.code,
            message: err.message,
        }
    }
}

/// Maps a backend failure for `path` into the driver taxonomy.
pub fn parse_error(path: &str, err: BackendError) -> DriverError {
    if err.is_not_found() {
        DriverError::NotFound(path.to_string())
    } else {
        err.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest<'a> {
    pub prefix: &'a str,
    pub delimiter: Option<&'a str>,
    /// Continuation token from the previous page.
    pub marker: Option<&'a str>,
    pub max_keys: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Grouping keys ending in the delimiter.
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectBackend: std::fmt::Debug + Send + Sync + 'static {
    /// Bucket (or equivalent namespace) name, used in copy sources.
    fn bucket_name(&self) -> &str;

    async fn get_object(&self, key: &str) -> BackendResult<Bytes>;

    /// Reads `len` bytes (or to the end) from `offset`. Ranges that start
    /// past the end fail with an `InvalidRange` error.
    async fn get_range(&self, key: &str, offset: u64, len: Option<u64>) -> BackendResult<Bytes>;

    async fn get_stream(&self, key: &str, offset: u64) -> BackendResult<ByteStream>;

    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()>;

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMeta>;

    async fn list_objects(&self, request: ListRequest<'_>) -> BackendResult<ListPage>;

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> BackendResult<()>;

    /// Deletes every key in `keys`. Keys that do not exist are ignored.
    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()>;

    /// Opens a multipart upload and returns its upload id.
    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<CompletedPart>;

    /// Produces a part by copying `range` (or all) of `source_key` on the
    /// server side.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
        range: Option<Range<u64>>,
    ) -> BackendResult<CompletedPart>;

    /// Publishes the object from `parts`, which must be in ascending order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;

    async fn presign(&self, key: &str, method: UrlMethod, expires_in: Duration)
    -> BackendResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes_are_normalized() {
        let err = parse_error("/a/b", BackendError::new("NoSuchKey", "gone"));
        assert!(matches!(err, DriverError::NotFound(p) if p == "/a/b"));

        let err = parse_error("/a/b", BackendError::new("Unknown", "").with_status(404));
        assert!(err.is_not_found());
    }

    #[test]
    fn other_codes_pass_through() {
        let err = parse_error("/a", BackendError::new("SlowDown", "reduce your request rate"));
        match err {
            DriverError::Backend { code, message } => {
                assert_eq!(code, "SlowDown");
                assert_eq!(message, "reduce your request rate");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
