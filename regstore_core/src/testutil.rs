//! Test utilities for `StorageDriver` implementations.
//!
//! This module provides a conformance suite that can be run against any
//! `StorageDriver` implementation to verify it honors the storage contract.
//!
//! # Usage
//!
//! In your driver crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! regstore_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use regstore_core::testutil::DriverTests;
//!
//! #[tokio::test]
//! async fn test_my_driver() {
//!     let driver = MyDriver::new(...);
//!     DriverTests::new(&driver, CHUNK_SIZE).run_all().await.unwrap();
//! }
//! ```

/// Assert that two byte slices are equal with a descriptive message.
#[macro_export]
macro_rules! assert_bytes_eq {
    ($left:expr, $right:expr) => {
        assert_eq!(
            AsRef::<[u8]>::as_ref(&$left),
            AsRef::<[u8]>::as_ref(&$right),
            "byte content mismatch"
        );
    };
    ($left:expr, $right:expr, $($arg:tt)+) => {
        assert_eq!(
            AsRef::<[u8]>::as_ref(&$left),
            AsRef::<[u8]>::as_ref(&$right),
            $($arg)+
        );
    };
}

use crate::driver::{ByteStream, StorageDriver, UrlOptions};
use crate::error::{DriverError, DriverResult};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;

/// Conformance suite for `StorageDriver` implementations.
///
/// Streaming-write cases are sized relative to the driver's chunk size so
/// they cross zero, one and several part boundaries.
pub struct DriverTests<'a, D> {
    driver: &'a D,
    /// Root for test paths to avoid conflicts
    root: String,
    chunk_size: usize,
}

impl<'a, D: StorageDriver> DriverTests<'a, D> {
    /// Create a new test suite for the given driver.
    pub fn new(driver: &'a D, chunk_size: usize) -> Self {
        let root = format!("/_test_{}", rand::rng().random::<u32>());
        Self {
            driver,
            root,
            chunk_size,
        }
    }

    /// Create a new test suite rooted at a custom path.
    pub fn with_root(driver: &'a D, chunk_size: usize, root: impl Into<String>) -> Self {
        Self {
            driver,
            root: root.into(),
            chunk_size,
        }
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    /// Run all tests.
    pub async fn run_all(&self) -> DriverResult<()> {
        self.test_put_get_content().await?;
        self.test_overwrite().await?;
        self.test_missing().await?;
        self.test_read_stream_offsets().await?;
        self.test_write_stream_from_zero().await?;
        self.test_write_stream_resume().await?;
        self.test_write_stream_gap().await?;
        self.test_write_stream_source_failure().await?;
        self.test_stat().await?;
        self.test_list().await?;
        self.test_delete_recursive().await?;
        self.test_move().await?;
        self.test_url_for().await?;

        // Cleanup
        self.cleanup().await
    }

    /// Test whole-object round trips, including an empty object.
    pub async fn test_put_get_content(&self) -> DriverResult<()> {
        for (name, data) in [
            ("content_empty", Bytes::new()),
            ("content_small", Bytes::from_static(b"hello, world!")),
            ("content_random", random_bytes(64 * 1024 + 3)),
        ] {
            let path = self.path(name);
            self.driver.put_content(&path, data.clone()).await?;

            let retrieved = self.driver.get_content(&path).await?;
            assert_bytes_eq!(retrieved, data, "round trip mismatch for {path}");
        }

        Ok(())
    }

    /// Test that a second put replaces the first.
    pub async fn test_overwrite(&self) -> DriverResult<()> {
        let path = self.path("overwrite_test.bin");

        self.driver
            .put_content(&path, Bytes::from_static(b"original content"))
            .await?;
        self.driver
            .put_content(&path, Bytes::from_static(b"new content"))
            .await?;

        let retrieved = self.driver.get_content(&path).await?;
        assert_eq!(
            retrieved.as_ref(),
            b"new content",
            "overwritten content should be new"
        );

        Ok(())
    }

    /// Test that reads of absent paths are `NotFound`.
    pub async fn test_missing(&self) -> DriverResult<()> {
        let path = self.path("does/not/exist");

        assert!(matches!(
            self.driver.get_content(&path).await,
            Err(DriverError::NotFound(_))
        ));
        assert!(matches!(
            self.driver.read_stream(&path, 0).await,
            Err(DriverError::NotFound(_))
        ));
        assert!(matches!(
            self.driver.stat(&path).await,
            Err(DriverError::NotFound(_))
        ));

        Ok(())
    }

    /// Test reads starting inside, at and past the end of an object.
    pub async fn test_read_stream_offsets(&self) -> DriverResult<()> {
        let path = self.path("read_stream.bin");
        let data = Bytes::from_static(b"0123456789abcdef");
        self.driver.put_content(&path, data.clone()).await?;

        let read = read_all(self.driver.read_stream(&path, 0).await?).await?;
        assert_eq!(read, data.as_ref());

        let read = read_all(self.driver.read_stream(&path, 5).await?).await?;
        assert_eq!(read, b"56789abcdef", "offset read should work");

        for offset in [16, 17, 1024] {
            let read = read_all(self.driver.read_stream(&path, offset).await?).await?;
            assert!(read.is_empty(), "read at {offset} should be empty");
        }

        Ok(())
    }

    /// Test streaming writes at offset zero around part boundaries.
    pub async fn test_write_stream_from_zero(&self) -> DriverResult<()> {
        let chunk = self.chunk_size;
        for len in [0, 1, chunk, chunk + 1, 2 * chunk + 17] {
            let path = self.path(&format!("write_zero_{len}"));
            let data = random_bytes(len);

            let consumed = self
                .driver
                .write_stream(&path, 0, stream_of(data.clone()))
                .await
                .map_err(|e| e.source)?;
            assert_eq!(consumed, len as u64, "consumed count for {len} bytes");

            let retrieved = self.driver.get_content(&path).await?;
            assert_bytes_eq!(retrieved, data, "offset-zero write of {len} bytes");
            assert_eq!(self.driver.stat(&path).await?.size, len as u64);
        }

        Ok(())
    }

    /// Test resuming a write inside existing content.
    pub async fn test_write_stream_resume(&self) -> DriverResult<()> {
        let chunk = self.chunk_size;
        let cases = [
            (1000, 0),
            (1000, 500),
            (1000, 1000),
            (chunk + 1024, 100),
            (chunk + 1024, chunk - 1),
            (chunk + 1024, chunk),
            (chunk + 1024, chunk + 1024),
        ];

        for (len, offset) in cases {
            let path = self.path(&format!("resume_{len}_{offset}"));
            let first = random_bytes(len);
            let second = random_bytes(chunk / 2 + 3);

            self.write_all(&path, 0, first.clone()).await?;
            self.write_all(&path, offset as u64, second.clone()).await?;

            let mut expected = first[..offset].to_vec();
            expected.extend_from_slice(&second);

            let retrieved = self.driver.get_content(&path).await?;
            assert_bytes_eq!(
                retrieved,
                expected,
                "resume of {len} bytes at offset {offset}"
            );
        }

        Ok(())
    }

    /// Test that writing past the end zero-fills the gap.
    pub async fn test_write_stream_gap(&self) -> DriverResult<()> {
        let chunk = self.chunk_size;
        let cases = [
            (1000, 1010),
            (1000, chunk + 5),
            (1000, 2 * chunk + 5),
            (0, chunk),
            (chunk + 100, chunk + 101),
            (chunk + 100, 3 * chunk + 3),
        ];

        for (len, offset) in cases {
            let path = self.path(&format!("gap_{len}_{offset}"));
            let first = random_bytes(len);
            let second = random_bytes(4096);

            if len > 0 {
                self.write_all(&path, 0, first.clone()).await?;
            }
            self.write_all(&path, offset as u64, second.clone()).await?;

            let mut expected = first.to_vec();
            expected.resize(offset, 0);
            expected.extend_from_slice(&second);

            let retrieved = self.driver.get_content(&path).await?;
            assert_eq!(
                retrieved.len(),
                expected.len(),
                "gap write of {len} bytes at offset {offset} has wrong length"
            );
            assert_bytes_eq!(
                retrieved,
                expected,
                "gap write of {len} bytes at offset {offset}"
            );
        }

        Ok(())
    }

    /// Test that a failing source reports exactly the bytes it delivered.
    pub async fn test_write_stream_source_failure(&self) -> DriverResult<()> {
        for len in [100, self.chunk_size + 1000] {
            let path = self.path(&format!("source_failure_{len}"));
            let data = random_bytes(len);

            let err = self
                .driver
                .write_stream(&path, 0, failing_stream_of(data))
                .await
                .expect_err("a failing source must fail the write");
            assert_eq!(err.consumed, len as u64, "consumed before failure");
            assert!(matches!(err.source, DriverError::Io(_)));

            assert!(
                matches!(self.driver.stat(&path).await, Err(DriverError::NotFound(_))),
                "a failed write must not publish an object"
            );
        }

        Ok(())
    }

    /// Test file versus directory detection.
    pub async fn test_stat(&self) -> DriverResult<()> {
        let file = self.path("stat/dir/file");
        self.driver
            .put_content(&file, Bytes::from_static(b"0123456789"))
            .await?;

        let info = self.driver.stat(&file).await?;
        assert!(!info.is_dir, "exact key should be a file");
        assert_eq!(info.size, 10);
        assert_eq!(info.path, file);

        let dir = self.path("stat/dir");
        let info = self.driver.stat(&dir).await?;
        assert!(info.is_dir, "prefix of other keys should be a directory");
        assert_eq!(info.path, dir);

        // Prefix of a key, but not on a path boundary.
        let partial = self.path("stat/dir/fil");
        assert!(matches!(
            self.driver.stat(&partial).await,
            Err(DriverError::NotFound(_))
        ));

        Ok(())
    }

    /// Test listing of immediate children.
    pub async fn test_list(&self) -> DriverResult<()> {
        let files = ["list/a", "list/b", "list/sub/c", "list/sub/d", "list/other/e"];
        for file in &files {
            self.driver
                .put_content(&self.path(file), Bytes::from_static(b"list test"))
                .await?;
        }

        let listed = self.driver.list(&self.path("list")).await?;
        let expected = [
            self.path("list/a"),
            self.path("list/b"),
            self.path("list/other"),
            self.path("list/sub"),
        ];
        assert_eq!(listed.len(), expected.len(), "listed: {listed:?}");
        // Files first, then directories.
        assert!(listed[..2].contains(&expected[0]) && listed[..2].contains(&expected[1]));
        assert!(listed[2..].contains(&expected[2]) && listed[2..].contains(&expected[3]));

        let listed = self.driver.list(&self.path("list/sub")).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&self.path("list/sub/c")));

        let root = self.driver.list("/").await?;
        assert!(root.contains(&self.root), "root listing should contain {}", self.root);

        Ok(())
    }

    /// Test that delete removes a whole subtree and nothing else.
    pub async fn test_delete_recursive(&self) -> DriverResult<()> {
        let files = ["del/x", "del/y", "del/b/z"];
        for file in &files {
            self.driver
                .put_content(&self.path(file), Bytes::from_static(b"to be deleted"))
                .await?;
        }
        let sibling = self.path("del-sibling");
        self.driver
            .put_content(&sibling, Bytes::from_static(b"keep me"))
            .await?;

        self.driver.delete(&self.path("del")).await?;

        for file in &files {
            assert!(
                matches!(
                    self.driver.stat(&self.path(file)).await,
                    Err(DriverError::NotFound(_))
                ),
                "{file} should be gone after delete"
            );
        }
        assert!(
            self.driver.stat(&sibling).await.is_ok(),
            "sibling sharing a name prefix must survive"
        );
        assert!(matches!(
            self.driver.delete(&self.path("del")).await,
            Err(DriverError::NotFound(_))
        ));

        Ok(())
    }

    /// Test moving an object.
    pub async fn test_move(&self) -> DriverResult<()> {
        let source = self.path("move/source");
        let dest = self.path("move/dest");
        let data = random_bytes(2048);
        self.driver.put_content(&source, data.clone()).await?;

        self.driver.move_path(&source, &dest).await?;

        assert_bytes_eq!(self.driver.get_content(&dest).await?, data);
        assert!(matches!(
            self.driver.stat(&source).await,
            Err(DriverError::NotFound(_))
        ));
        assert!(matches!(
            self.driver
                .move_path(&self.path("move/missing"), &dest)
                .await,
            Err(DriverError::NotFound(_))
        ));

        Ok(())
    }

    /// Test signed URL options.
    pub async fn test_url_for(&self) -> DriverResult<()> {
        let path = self.path("url/object");
        self.driver
            .put_content(&path, Bytes::from_static(b"signed"))
            .await?;

        let url = self.driver.url_for(&path, UrlOptions::default()).await?;
        assert!(!url.is_empty(), "GET url should not be empty");

        let head = self
            .driver
            .url_for(
                &path,
                UrlOptions {
                    method: Some("HEAD".into()),
                    expiry: None,
                },
            )
            .await?;
        assert!(!head.is_empty(), "HEAD url should not be empty");
        assert_ne!(head, url, "HEAD and GET urls should differ");

        let options = UrlOptions {
            method: Some("DELETE".into()),
            expiry: None,
        };
        assert!(matches!(
            self.driver.url_for(&path, options).await,
            Err(DriverError::UnsupportedMethod)
        ));

        Ok(())
    }

    /// Clean up test files.
    pub async fn cleanup(&self) -> DriverResult<()> {
        match self.driver.delete(&self.root).await {
            Ok(()) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn write_all(&self, path: &str, offset: u64, data: Bytes) -> DriverResult<()> {
        let len = data.len() as u64;
        let consumed = self
            .driver
            .write_stream(path, offset, stream_of(data))
            .await
            .map_err(|e| e.source)?;
        assert_eq!(consumed, len, "write to {path} should consume the source");
        Ok(())
    }
}

/// Size of the pieces `stream_of` yields; deliberately not a power of two.
const PIECE: usize = 64 * 1024 + 7;

/// Stream `data` in uneven pieces.
pub fn stream_of(data: Bytes) -> ByteStream {
    let pieces: Vec<Result<Bytes, std::io::Error>> = data
        .chunks(PIECE)
        .map(|piece| Ok(data.slice_ref(piece)))
        .collect();
    Box::new(futures::stream::iter(pieces))
}

/// Stream `data` in uneven pieces, then fail.
pub fn failing_stream_of(data: Bytes) -> ByteStream {
    let mut pieces: Vec<Result<Bytes, std::io::Error>> = data
        .chunks(PIECE)
        .map(|piece| Ok(data.slice_ref(piece)))
        .collect();
    pieces.push(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "source failed",
    )));
    Box::new(futures::stream::iter(pieces))
}

/// Drain a byte stream into memory.
pub async fn read_all(mut stream: ByteStream) -> DriverResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Generate random bytes for testing.
pub fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    Bytes::from(data)
}
