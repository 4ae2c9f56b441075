use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;

use crate::error::{DriverError, DriverResult, PartialWrite};

/// Boxed byte stream used for both streaming reads and streaming writes.
pub type ByteStream = Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static>;

/// The storage contract a registry talks to.
///
/// Paths are slash-rooted logical paths. Implementations assume a single
/// writer per path; concurrent `write_stream` calls against the same path
/// interleave in an undefined way.
#[async_trait]
pub trait StorageDriver: std::fmt::Debug + Send + Sync + 'static {
    /// Short backend name, used in logs.
    fn name(&self) -> &'static str;

    async fn get_content(&self, path: &str) -> DriverResult<Bytes>;

    /// Stores `content` as the whole object at `path`, replacing anything
    /// already there. Safe to retry.
    async fn put_content(&self, path: &str, content: Bytes) -> DriverResult<()>;

    /// Streams the object at `path` starting at `offset`. An offset at or
    /// past the end yields an empty stream.
    async fn read_stream(&self, path: &str, offset: u64) -> DriverResult<ByteStream>;

    /// Writes `source` at `offset`, keeping existing bytes below `offset`
    /// and zero-filling any gap between the current end and `offset`.
    ///
    /// Returns the number of bytes consumed from `source`. On failure the
    /// count is still reported through `PartialWrite::consumed`.
    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<u64, PartialWrite>;

    async fn stat(&self, path: &str) -> DriverResult<FileInfo>;

    /// Immediate children of `path`: files first, then directories.
    async fn list(&self, path: &str) -> DriverResult<Vec<String>>;

    /// Moves `source` to `dest`. Not atomic: a failure after the copy can
    /// leave the object at both paths.
    async fn move_path(&self, source: &str, dest: &str) -> DriverResult<()>;

    /// Removes `path` and everything below it.
    async fn delete(&self, path: &str) -> DriverResult<()>;

    async fn url_for(&self, path: &str, options: UrlOptions) -> DriverResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    /// Unknown for directories.
    pub mod_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: u64, mod_time: Option<DateTime<Utc>>) -> Self {
        Self {
            path: path.into(),
            size,
            mod_time,
            is_dir: false,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            mod_time: None,
            is_dir: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlOptions {
    /// HTTP method the URL is signed for; `GET` when unset.
    pub method: Option<String>,
    /// Absolute expiry; 20 minutes from now when unset.
    pub expiry: Option<DateTime<Utc>>,
}

impl UrlOptions {
    pub fn method(&self) -> DriverResult<UrlMethod> {
        match &self.method {
            Some(method) => method.parse(),
            None => Ok(UrlMethod::Get),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMethod {
    Get,
    Head,
}

impl UrlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlMethod::Get => "GET",
            UrlMethod::Head => "HEAD",
        }
    }
}

impl FromStr for UrlMethod {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(UrlMethod::Get)
        } else if s.eq_ignore_ascii_case("HEAD") {
            Ok(UrlMethod::Head)
        } else {
            Err(DriverError::UnsupportedMethod)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_method_defaults_to_get() {
        assert_eq!(UrlOptions::default().method().unwrap(), UrlMethod::Get);
    }

    #[test]
    fn url_method_rejects_writes() {
        let options = UrlOptions {
            method: Some("PUT".into()),
            expiry: None,
        };
        assert!(matches!(
            options.method(),
            Err(DriverError::UnsupportedMethod)
        ));
        assert_eq!("head".parse::<UrlMethod>().unwrap(), UrlMethod::Head);
    }
}
