use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regstore_core::{
    ByteStream, DriverError, DriverResult, FileInfo, PartialWrite, StorageDriver, UrlOptions,
};

use crate::backend::{BackendResult, LIST_MAX, ListRequest, ObjectBackend, parse_error};
use crate::bucket::BucketBackend;
use crate::config::{DriverParameters, S3DriverConfig};
use crate::key::KeyMapper;
use crate::multipart;
use crate::pool::BufferPool;

/// Signed URLs live this long unless the caller sets an expiry.
const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(20 * 60);

/// `StorageDriver` that keeps each path as one object in an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Driver<B: ObjectBackend = BucketBackend> {
    backend: Arc<B>,
    keys: KeyMapper,
    pool: BufferPool,
}

impl S3Driver<BucketBackend> {
    /// Validates `config`, connects to the bucket and checks it is reachable.
    pub async fn new(config: &S3DriverConfig) -> DriverResult<Self> {
        let params = config.validate()?;
        let backend = BucketBackend::connect(&params)?;
        Self::from_backend(backend, &params).await
    }
}

impl<B: ObjectBackend> S3Driver<B> {
    /// Builds a driver over an already connected backend.
    ///
    /// Lists the root directory once so a missing bucket or bad credentials
    /// fail here rather than on first use.
    pub async fn from_backend(backend: B, params: &DriverParameters) -> DriverResult<Self> {
        let driver = Self {
            backend: Arc::new(backend),
            keys: KeyMapper::new(&params.root_directory),
            pool: BufferPool::new(params.chunk_size),
        };
        let prefix = driver.keys.dir_prefix("/");
        driver
            .backend
            .list_objects(ListRequest {
                prefix: &prefix,
                delimiter: None,
                marker: None,
                max_keys: 1,
            })
            .await?;
        tracing::info!(
            bucket = driver.backend.bucket_name(),
            root = %params.root_directory,
            chunk_size = params.chunk_size,
            "s3 driver ready"
        );
        Ok(driver)
    }

    /// Shares `pool` with other drivers of the same chunk size.
    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        if pool.chunk_size() == self.pool.chunk_size() {
            self.pool = pool;
        } else {
            tracing::warn!(
                ours = self.pool.chunk_size(),
                theirs = pool.chunk_size(),
                "ignoring buffer pool with a different chunk size"
            );
        }
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Object key `path` is stored under.
    pub fn bucket_key(&self, path: &str) -> String {
        self.keys.key(path)
    }

    async fn has_children(&self, key: &str) -> BackendResult<bool> {
        let prefix = format!("{key}/");
        let page = self
            .backend
            .list_objects(ListRequest {
                prefix: &prefix,
                delimiter: Some("/"),
                marker: None,
                max_keys: 1,
            })
            .await?;
        Ok(!page.objects.is_empty() || !page.common_prefixes.is_empty())
    }
}

#[async_trait]
impl<B: ObjectBackend> StorageDriver for S3Driver<B> {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn get_content(&self, path: &str) -> DriverResult<Bytes> {
        self.backend
            .get_object(&self.keys.key(path))
            .await
            .map_err(|e| parse_error(path, e))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> DriverResult<()> {
        self.backend
            .put_object(&self.keys.key(path), content)
            .await
            .map_err(|e| parse_error(path, e))
    }

    async fn read_stream(&self, path: &str, offset: u64) -> DriverResult<ByteStream> {
        match self.backend.get_stream(&self.keys.key(path), offset).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_invalid_range() => {
                Ok(Box::new(futures::stream::empty::<Result<Bytes, std::io::Error>>()))
            }
            Err(e) => Err(parse_error(path, e)),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<u64, PartialWrite> {
        multipart::write_stream(&self.backend, &self.pool, &self.keys.key(path), offset, source)
            .await
            .map_err(|err| match err.source {
                DriverError::Backend { ref code, .. } if code == "NoSuchKey" => {
                    PartialWrite::new(err.consumed, DriverError::NotFound(path.to_string()))
                }
                _ => err,
            })
    }

    async fn stat(&self, path: &str) -> DriverResult<FileInfo> {
        let key = self.keys.key(path);
        let page = self
            .backend
            .list_objects(ListRequest {
                prefix: &key,
                delimiter: None,
                marker: None,
                max_keys: 1,
            })
            .await
            .map_err(|e| parse_error(path, e))?;

        if let Some(object) = page.objects.first() {
            if object.key == key {
                return Ok(FileInfo::file(path, object.size, object.last_modified));
            }
            if object.key.starts_with(&format!("{key}/")) {
                return Ok(FileInfo::dir(path));
            }
        }

        // The first match was a sibling such as `key-suffix`; look below
        // `key/` explicitly.
        if self
            .has_children(&key)
            .await
            .map_err(|e| parse_error(path, e))?
        {
            return Ok(FileInfo::dir(path));
        }
        Err(DriverError::NotFound(path.to_string()))
    }

    async fn list(&self, path: &str) -> DriverResult<Vec<String>> {
        let prefix = self.keys.dir_prefix(path);
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .backend
                .list_objects(ListRequest {
                    prefix: &prefix,
                    delimiter: Some("/"),
                    marker: marker.as_deref(),
                    max_keys: LIST_MAX,
                })
                .await
                .map_err(|e| parse_error(path, e))?;

            // A placeholder object named like the directory itself is skipped.
            files.extend(
                page.objects
                    .iter()
                    .filter(|o| o.key != prefix)
                    .map(|o| self.keys.path(&o.key)),
            );
            dirs.extend(
                page.common_prefixes
                    .iter()
                    .map(|p| self.keys.path(p.trim_end_matches('/'))),
            );

            match page.next_marker {
                Some(next) if page.is_truncated => marker = Some(next),
                _ => break,
            }
        }

        files.extend(dirs);
        Ok(files)
    }

    async fn move_path(&self, source: &str, dest: &str) -> DriverResult<()> {
        let source_key = self.keys.key(source);
        self.backend
            .copy_object(&source_key, &self.keys.key(dest))
            .await
            .map_err(|e| parse_error(source, e))?;
        self.backend
            .delete_objects(&[source_key])
            .await
            .map_err(|e| parse_error(source, e))
    }

    async fn delete(&self, path: &str) -> DriverResult<()> {
        let key = self.keys.key(path);
        let prefix = format!("{key}/");
        let mut deleted = 0usize;

        // Listing after each batch instead of paging keeps the marker valid
        // while keys disappear under it.
        loop {
            let page = self
                .backend
                .list_objects(ListRequest {
                    prefix: &prefix,
                    delimiter: None,
                    marker: None,
                    max_keys: LIST_MAX,
                })
                .await
                .map_err(|e| parse_error(path, e))?;
            if page.objects.is_empty() {
                break;
            }
            let keys: Vec<String> = page.objects.into_iter().map(|o| o.key).collect();
            self.backend
                .delete_objects(&keys)
                .await
                .map_err(|e| parse_error(path, e))?;
            deleted += keys.len();
            if !page.is_truncated {
                break;
            }
        }

        match self.backend.head_object(&key).await {
            Ok(_) => {
                self.backend
                    .delete_objects(std::slice::from_ref(&key))
                    .await
                    .map_err(|e| parse_error(path, e))?;
                deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(parse_error(path, e)),
        }

        if deleted == 0 {
            return Err(DriverError::NotFound(path.to_string()));
        }
        tracing::debug!(path, objects = deleted, "deleted");
        Ok(())
    }

    async fn url_for(&self, path: &str, options: UrlOptions) -> DriverResult<String> {
        let method = options.method()?;
        let expires_in = match options.expiry {
            Some(expiry) => (expiry - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_secs(1)),
            None => DEFAULT_URL_EXPIRY,
        };
        self.backend
            .presign(&self.keys.key(path), method, expires_in)
            .await
            .map_err(|e| parse_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use regstore_core::UrlMethod;

    use super::*;
    use crate::backend::MIN_PART_SIZE;
    use crate::memory::MemoryBackend;

    async fn driver(root: &str) -> S3Driver<MemoryBackend> {
        let mut config = S3DriverConfig::new("us-east-1", "registry");
        config.chunk_size = MIN_PART_SIZE;
        config.root_directory = root.to_string();
        let params = config.validate().unwrap();
        S3Driver::from_backend(MemoryBackend::new("registry"), &params)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn keys_live_under_root_directory() {
        let driver = driver("/registry/root").await;
        driver
            .put_content("/a/b", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(driver.backend().contains_key("registry/root/a/b"));
        assert_eq!(driver.bucket_key("/a/b"), "registry/root/a/b");
        assert_eq!(driver.list("/").await.unwrap(), vec!["/a".to_string()]);
    }

    #[tokio::test]
    async fn stat_ignores_siblings_sharing_a_prefix() {
        let driver = driver("").await;
        driver
            .put_content("/dir-suffix", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(driver.stat("/dir").await.unwrap_err().is_not_found());

        driver
            .put_content("/dir/child", Bytes::from_static(b"y"))
            .await
            .unwrap();
        let info = driver.stat("/dir").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 0);
        assert!(info.mod_time.is_none());
    }

    #[tokio::test]
    async fn stat_reports_size_and_mod_time() {
        let driver = driver("").await;
        driver
            .put_content("/file", Bytes::from_static(b"12345"))
            .await
            .unwrap();
        let info = driver.stat("/file").await.unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 5);
        assert!(info.mod_time.is_some());
    }

    #[tokio::test]
    async fn empty_directory_lists_nothing() {
        let driver = driver("").await;
        assert!(driver.list("/nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_missing_path_is_not_found() {
        let driver = driver("").await;
        assert!(driver.delete("/missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn url_expiry_and_method() {
        let driver = driver("").await;
        let url = driver
            .url_for(
                "/blob",
                UrlOptions {
                    method: Some("head".into()),
                    expiry: Some(Utc::now() + TimeDelta::seconds(90)),
                },
            )
            .await
            .unwrap();
        assert!(url.contains(&format!("method={}", UrlMethod::Head.as_str())));
        assert!(url.contains("expires=8") || url.contains("expires=9"), "{url}");

        let url = driver.url_for("/blob", UrlOptions::default()).await.unwrap();
        assert!(url.contains("expires=1200"), "{url}");

        // Past expiries still yield a usable, if short-lived, URL.
        let url = driver
            .url_for(
                "/blob",
                UrlOptions {
                    method: None,
                    expiry: Some(Utc::now() - TimeDelta::minutes(5)),
                },
            )
            .await
            .unwrap();
        assert!(url.contains("expires=1"), "{url}");
    }

    #[tokio::test]
    async fn pools_are_shared_only_when_chunk_sizes_match() {
        let driver = driver("").await;
        let shared = BufferPool::new(MIN_PART_SIZE as usize);
        let driver = driver.with_pool(shared.clone());
        {
            let _buf = driver.pool().acquire();
        }
        assert_eq!(shared.idle(), 1);

        let other = BufferPool::new(2 * MIN_PART_SIZE as usize);
        let driver = driver.with_pool(other);
        assert_eq!(driver.pool().chunk_size(), MIN_PART_SIZE as usize);
    }
}
