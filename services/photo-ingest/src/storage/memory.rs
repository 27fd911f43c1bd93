//! In-memory object store with call accounting and fault injection.

use super::{ObjectStore, ObjectSummary, StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

/// Storage operation kinds, used for call counting and injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Get,
    List,
    Put,
    Copy,
    Delete,
}

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    calls: Mutex<HashMap<StorageOp, u32>>,
    failures: Mutex<HashMap<StorageOp, u32>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a put.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: None,
                tags: BTreeMap::new(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// All keys in a bucket, in key order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Make the next `times` calls of `op` fail with a retryable error.
    pub fn fail_next(&self, op: StorageOp, times: u32) {
        self.failures.lock().insert(op, times);
    }

    /// Make every call of `op` fail with a retryable error.
    pub fn fail_always(&self, op: StorageOp) {
        self.fail_next(op, u32::MAX);
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: StorageOp) -> u32 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn record(&self, op: StorageOp) -> StorageResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let mut failures = self.failures.lock();
        match failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(StorageError::S3(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes> {
        self.record(StorageOp::Get)?;
        let body = self
            .object(bucket, key)
            .map(|o| o.body)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let size = body.len() as u64;
        if size > max_bytes {
            return Err(StorageError::TooLarge {
                size,
                limit: max_bytes,
            });
        }
        Ok(body)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> StorageResult<Vec<ObjectSummary>> {
        self.record(StorageOp::List)?;
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .take(max_keys)
            .map(|((_, k), o)| ObjectSummary {
                key: k.clone(),
                size: o.body.len() as u64,
            })
            .collect())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        self.record(StorageOp::Put)?;
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: Some(content_type.to_string()),
                tags: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        tags: &[(String, String)],
    ) -> StorageResult<()> {
        self.record(StorageOp::Copy)?;
        let source = self
            .object(bucket, source_key)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: source_key.to_string(),
            })?;

        self.objects.write().insert(
            (bucket.to_string(), dest_key.to_string()),
            StoredObject {
                tags: tags.iter().cloned().collect(),
                ..source
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.record(StorageOp::Delete)?;
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_respects_prefix_and_limit() {
        let store = MemoryObjectStore::new();
        store.insert("dest", "processed/photo-2024-01-15_a/a.json", "a");
        store.insert("dest", "processed/photo-2024-01-15_b/b.json", "b");
        store.insert("dest", "processed/photo-2024-01-16_c/c.json", "c");
        store.insert("other", "processed/photo-2024-01-15_d/d.json", "d");

        let listed = store
            .list_objects("dest", "processed/photo-2024-01-15", 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "processed/photo-2024-01-15_a/a.json");

        let limited = store.list_objects("dest", "processed/", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.insert("b", "k", "v");
        store.fail_next(StorageOp::Get, 1);

        assert!(store.get_object("b", "k", 10).await.is_err());
        assert_eq!(store.get_object("b", "k", 10).await.unwrap(), Bytes::from("v"));
        assert_eq!(store.calls(StorageOp::Get), 2);
    }

    #[tokio::test]
    async fn test_get_refuses_objects_over_limit() {
        let store = MemoryObjectStore::new();
        store.insert("b", "k", "0123456789");

        assert!(matches!(
            store.get_object("b", "k", 9).await,
            Err(StorageError::TooLarge { size: 10, limit: 9 })
        ));
        assert_eq!(store.get_object("b", "k", 10).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_copy_replaces_tags() {
        let store = MemoryObjectStore::new();
        store.insert("b", "IMG_1.jpg", "jpeg");
        let tags = vec![("confidence".to_string(), "high".to_string())];

        store
            .copy_object("b", "IMG_1.jpg", "duplicates/IMG_1.jpg", &tags)
            .await
            .unwrap();

        let copy = store.object("b", "duplicates/IMG_1.jpg").unwrap();
        assert_eq!(copy.body, Bytes::from("jpeg"));
        assert_eq!(copy.tags.get("confidence").map(String::as_str), Some("high"));
    }
}
