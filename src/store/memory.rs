//! In-process blob store

use super::{validate_location, BlobStore};
use crate::config::MAX_PRESIGN_EXPIRES;
use crate::error::{CutoutError, Result};
use crate::types::{ObjectLocation, StorageObject};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Blob store holding objects in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectLocation, StorageObject>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a pipeline write
    pub async fn insert<B: Into<String>, K: Into<String>>(
        &self,
        bucket: B,
        key: K,
        bytes: Vec<u8>,
    ) {
        let location = ObjectLocation::new(bucket, key);
        let object = StorageObject {
            location: location.clone(),
            content_type: "application/octet-stream".to_string(),
            cache_control: String::new(),
            bytes,
        };
        self.objects.write().await.insert(location, object);
    }

    /// Stored object with its metadata
    pub async fn object(&self, location: &ObjectLocation) -> Option<StorageObject> {
        self.objects.read().await.get(location).cloned()
    }

    pub async fn locations(&self) -> Vec<ObjectLocation> {
        let mut locations: Vec<_> = self.objects.read().await.keys().cloned().collect();
        locations.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
        locations
    }

    /// Number of `put_object` calls so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put_object(&self, object: StorageObject) -> Result<()> {
        validate_location(&object.location)?;
        log::debug!(
            "memory store: put {} ({} bytes)",
            object.location,
            object.bytes.len()
        );
        self.objects
            .write()
            .await
            .insert(object.location.clone(), object);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .read()
            .await
            .get(location)
            .map(|object| object.bytes.clone()))
    }

    async fn presign_get(&self, location: &ObjectLocation, expires_secs: u64) -> Result<String> {
        if expires_secs == 0 || expires_secs > MAX_PRESIGN_EXPIRES {
            return Err(CutoutError::storage(format!(
                "Presign expiry {expires_secs}s outside 1-{MAX_PRESIGN_EXPIRES}"
            )));
        }
        let date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        Ok(format!(
            "memory://{}/{}?X-Amz-Expires={expires_secs}&X-Amz-Date={date}",
            location.bucket, location.key
        ))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
