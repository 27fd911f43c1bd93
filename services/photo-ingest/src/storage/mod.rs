//! Object storage seam.
//!
//! The pipeline only talks to storage through [`ObjectStore`], always wrapped
//! in the [`retry::RetryPolicy`] transport. [`s3::S3ObjectStore`] is the
//! production backend; [`memory::MemoryObjectStore`] backs tests and dry runs.

pub mod memory;
pub mod retry;
pub mod s3;

pub use memory::{MemoryObjectStore, StorageOp, StoredObject};
pub use retry::RetryPolicy;
pub use s3::S3ObjectStore;

use bytes::Bytes;
use thiserror::Error;

/// Storage layer errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Object is {size} bytes, over the {limit} byte read limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("S3 error: {0}")]
    S3(String),
}

impl StorageError {
    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::S3(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Minimal object storage interface used by the ingestion pipeline.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object, refusing objects larger than `max_bytes` before
    /// their body is buffered.
    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes>;

    /// List up to `max_keys` objects under `prefix`, in key order.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> StorageResult<Vec<ObjectSummary>>;

    /// Write an object, replacing any existing one at the key.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()>;

    /// Server-side copy within a bucket, replacing the copy's tags with `tags`.
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        tags: &[(String, String)],
    ) -> StorageResult<()>;

    /// Delete an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;
}

/// Get content type for an image file extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("JPG"), "image/jpeg");
        assert_eq!(content_type_for("tif"), "image/tiff");
        assert_eq!(content_type_for("json"), "application/json");
        assert_eq!(content_type_for("unknown"), "application/octet-stream");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StorageError::S3("throttled".to_string()).is_retryable());
        assert!(!StorageError::Rejected("AccessDenied".to_string()).is_retryable());
        assert!(!StorageError::TooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(!StorageError::NotFound {
            bucket: "b".to_string(),
            key: "k".to_string()
        }
        .is_retryable());
    }
}
