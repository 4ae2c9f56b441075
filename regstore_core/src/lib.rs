//! Core regstore types and traits.
//!
//! This crate defines the storage contract shared by every regstore crate:
//!
//! - The `StorageDriver` trait: whole-object reads and writes, ranged
//!   streaming reads, resumable streaming writes at an arbitrary offset,
//!   stat, listing, move, recursive delete and signed URLs.
//! - `FileInfo`, `UrlOptions` and the `DriverError` taxonomy.
//! - Logical path validation and the `Validated` facade that applies it in
//!   front of any driver.
//!
//! Logical paths are slash-rooted (`/docker/registry/v2/...`). Directories
//! are never stored; a path is a directory when other paths live below it.

pub mod base;
pub mod driver;
pub mod error;
pub mod path;

// Conformance suite (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use base::Validated;
pub use driver::{ByteStream, FileInfo, StorageDriver, UrlMethod, UrlOptions};
pub use error::{DriverError, DriverResult, PartialWrite};
