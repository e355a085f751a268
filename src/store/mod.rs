//! Blob storage behind the input resolver and the sink
//!
//! A [`BlobStore`] is a key/value store that can also issue expiring GET URLs.
//! Three implementations ship: an in-process [`MemoryStore`], a directory-backed
//! [`FsStore`] and an S3-compatible [`S3Store`] signing requests with SigV4.

use crate::error::Result;
use crate::types::{ObjectLocation, StorageObject};
use async_trait::async_trait;

pub mod fs;
pub mod memory;
pub mod s3;
pub mod sigv4;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};
pub use sigv4::Credentials;

/// Object storage as seen by the pipeline
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Write an object, replacing any object at the same location
    ///
    /// # Errors
    /// - Transport or permission failures
    async fn put_object(&self, object: StorageObject) -> Result<()>;

    /// Read an object; `None` when it does not exist
    ///
    /// # Errors
    /// - Transport or permission failures
    async fn get_object(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>>;

    /// Time-limited GET URL for an object
    ///
    /// # Errors
    /// - Expiry outside the store's accepted range
    async fn presign_get(&self, location: &ObjectLocation, expires_secs: u64) -> Result<String>;

    /// Short store name for logs
    fn name(&self) -> &'static str;
}

/// Why `bucket` cannot name a bucket, if it cannot
pub(crate) fn bucket_problem(bucket: &str) -> Option<String> {
    if bucket.is_empty() || bucket.contains('/') || bucket == ".." {
        return Some(format!("Invalid bucket name '{bucket}'"));
    }
    None
}

/// Why `key` cannot name an object, if it cannot
pub(crate) fn key_problem(key: &str) -> Option<String> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Some(format!("Invalid object key '{key}'"));
    }
    None
}

/// Reject keys that could escape a bucket on path-based stores
///
/// # Errors
/// - Empty bucket or key, absolute keys, or `..` segments
pub(crate) fn validate_location(location: &ObjectLocation) -> Result<()> {
    match bucket_problem(&location.bucket).or_else(|| key_problem(&location.key)) {
        Some(problem) => Err(crate::error::CutoutError::storage(problem)),
        None => Ok(()),
    }
}
