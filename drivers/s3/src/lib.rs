//! S3 storage driver for regstore.
//!
//! Every logical path maps to one object key below an optional root
//! directory. Resumable writes are assembled with multipart uploads, so an
//! object only changes once a write has fully succeeded.
//!
//! `S3Driver` talks to the bucket through the `ObjectBackend` trait.
//! `BucketBackend` implements it over rust-s3; `MemoryBackend` emulates a
//! bucket in process for tests.

mod backend;
mod bucket;
mod config;
mod driver;
mod key;
mod memory;
mod multipart;
mod pool;
mod sigv4;

pub use backend::{
    BackendError, BackendResult, CompletedPart, LIST_MAX, ListPage, ListRequest, MAX_PART_SIZE,
    MIN_PART_SIZE, ObjectBackend, ObjectMeta,
};
pub use bucket::BucketBackend;
pub use config::{DEFAULT_CHUNK_SIZE, DriverParameters, S3DriverConfig};
pub use driver::S3Driver;
pub use key::KeyMapper;
pub use memory::MemoryBackend;
pub use pool::{BufferPool, PooledBuffer};

#[cfg(test)]
mod tests {
    // Requires an S3-compatible server (e.g. MinIO) with the bucket created.
    use super::*;
    use regstore_core::testutil::DriverTests;

    #[tokio::test]
    #[ignore = "requires S3-compatible server"]
    async fn test_s3_driver() {
        let mut config = S3DriverConfig::new("us-east-1", "test-bucket");
        config.region_endpoint = Some("http://localhost:9000".to_string());
        config.access_key = "minioadmin".to_string();
        config.secret_key = "minioadmin".to_string();
        config.path_style = true;
        config.chunk_size = MIN_PART_SIZE;
        config.root_directory = "/regstore-tests".to_string();

        let driver = S3Driver::new(&config).await.unwrap();
        DriverTests::new(&driver, MIN_PART_SIZE as usize)
            .run_all()
            .await
            .unwrap();
    }
}
