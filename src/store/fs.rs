//! Directory-backed blob store

use super::{validate_location, BlobStore};
use crate::config::MAX_PRESIGN_EXPIRES;
use crate::error::{CutoutError, Result};
use crate::types::{ObjectLocation, StorageObject};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Blob store laying objects out as `root/bucket/key`
///
/// Writes go to a temporary file in the destination directory and are renamed
/// into place, so readers never observe a partial object.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path of an object
    ///
    /// # Errors
    /// - Location that would escape the root
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf> {
        validate_location(location)?;
        Ok(self.root.join(&location.bucket).join(&location.key))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        CutoutError::storage(format!("No parent directory for '{}'", path.display()))
    })?;
    std::fs::create_dir_all(parent)
        .map_err(|e| CutoutError::file_io_error("create directory", parent, &e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| CutoutError::file_io_error("create temp file in", parent, &e))?;
    temp.write_all(bytes)
        .map_err(|e| CutoutError::file_io_error("write temp file for", path, &e))?;
    temp.persist(path)
        .map_err(|e| CutoutError::file_io_error("rename into", path, &e.error))?;
    Ok(())
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put_object(&self, object: StorageObject) -> Result<()> {
        let path = self.object_path(&object.location)?;
        let location = object.location.clone();
        let bytes = object.bytes;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &bytes))
            .await
            .map_err(|e| CutoutError::internal(format!("Store task failed: {e}")))?
            .map_err(|e| {
                let detail = e.to_string();
                CutoutError::storage_with_object("put", &location.bucket, &location.key, &detail)
            })?;
        log::debug!("fs store: wrote {}", path.display());
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(location)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CutoutError::file_io_error("read object", &path, &e)),
        }
    }

    async fn presign_get(&self, location: &ObjectLocation, expires_secs: u64) -> Result<String> {
        if expires_secs == 0 || expires_secs > MAX_PRESIGN_EXPIRES {
            return Err(CutoutError::storage(format!(
                "Presign expiry {expires_secs}s outside 1-{MAX_PRESIGN_EXPIRES}"
            )));
        }
        let path = self.object_path(location)?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|e| CutoutError::file_io_error("resolve", &path, &e))?
                .join(path)
        };
        let expires_at = chrono::Utc::now().timestamp() + expires_secs as i64;
        Ok(format!(
            "file://{}?X-Amz-Expires={expires_secs}&expires={expires_at}",
            absolute.display()
        ))
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_creates_directories() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let location = ObjectLocation::new("media", "cutouts/2024/a.png");

        store
            .put_object(StorageObject {
                location: location.clone(),
                content_type: "image/png".into(),
                cache_control: String::new(),
                bytes: b"png".to_vec(),
            })
            .await
            .unwrap();

        assert!(dir.path().join("media/cutouts/2024/a.png").is_file());
        assert_eq!(store.get_object(&location).await.unwrap(), Some(b"png".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_object_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let result = store
            .get_object(&ObjectLocation::new("media", "missing.png"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let result = store
            .get_object(&ObjectLocation::new("media", "../../etc/passwd"))
            .await;
        assert!(matches!(result, Err(CutoutError::Storage(_))));
    }

    #[tokio::test]
    async fn test_presign_is_file_url() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let url = store
            .presign_get(&ObjectLocation::new("media", "a.png"), 3600)
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("media/a.png"));
    }
}
