use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    driver::{ByteStream, FileInfo, StorageDriver, UrlOptions},
    error::{DriverResult, PartialWrite},
    path,
};

/// Facade placed in front of a driver.
///
/// Rejects malformed paths before they reach the backend and traces every
/// call with its duration.
#[derive(Debug, Clone)]
pub struct Validated<D> {
    inner: D,
}

impl<D: StorageDriver> Validated<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn trace(&self, op: &str, path: &str, started: Instant) {
        tracing::debug!(
            "{}.{op}({path}) took {:?}",
            self.inner.name(),
            started.elapsed()
        );
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for Validated<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_content(&self, path: &str) -> DriverResult<Bytes> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.get_content(path).await;
        self.trace("get_content", path, started);
        res
    }

    async fn put_content(&self, path: &str, content: Bytes) -> DriverResult<()> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.put_content(path, content).await;
        self.trace("put_content", path, started);
        res
    }

    async fn read_stream(&self, path: &str, offset: u64) -> DriverResult<ByteStream> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.read_stream(path, offset).await;
        self.trace("read_stream", path, started);
        res
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<u64, PartialWrite> {
        path::validate(path).map_err(|e| PartialWrite::new(0, e))?;
        let started = Instant::now();
        let res = self.inner.write_stream(path, offset, source).await;
        self.trace("write_stream", path, started);
        res
    }

    async fn stat(&self, path: &str) -> DriverResult<FileInfo> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.stat(path).await;
        self.trace("stat", path, started);
        res
    }

    async fn list(&self, path: &str) -> DriverResult<Vec<String>> {
        path::validate_dir(path)?;
        let started = Instant::now();
        let res = self.inner.list(path).await;
        self.trace("list", path, started);
        res
    }

    async fn move_path(&self, source: &str, dest: &str) -> DriverResult<()> {
        path::validate(source)?;
        path::validate(dest)?;
        let started = Instant::now();
        let res = self.inner.move_path(source, dest).await;
        self.trace("move_path", &format!("{source} -> {dest}"), started);
        res
    }

    async fn delete(&self, path: &str) -> DriverResult<()> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.delete(path).await;
        self.trace("delete", path, started);
        res
    }

    async fn url_for(&self, path: &str, options: UrlOptions) -> DriverResult<String> {
        path::validate(path)?;
        let started = Instant::now();
        let res = self.inner.url_for(path, options).await;
        self.trace("url_for", path, started);
        res
    }
}
