//! PNG encoding, key generation and reference production

use crate::config::{ReturnMode, StorageConfig};
use crate::error::{CutoutError, Result};
use crate::store::sigv4::uri_encode;
use crate::store::{self, BlobStore};
use crate::types::{Cutout, ObjectLocation, Provenance, Reference, SourceImage, StorageObject};
use instant::Instant;
use std::sync::Arc;
use tracing::{debug, info};

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Caller-chosen destination; unset fields fall back to configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTarget {
    pub bucket: Option<String>,
    /// Exact key; writing to it again overwrites the previous result
    pub key: Option<String>,
}

impl ObjectTarget {
    /// Reject caller-supplied names that cannot address an object
    ///
    /// # Errors
    /// - `Input` for empty or slash-bearing buckets, absolute keys and `..` segments
    pub fn validate(&self) -> Result<()> {
        let bucket = self.bucket.as_deref().and_then(store::bucket_problem);
        match bucket.or_else(|| self.key.as_deref().and_then(store::key_problem)) {
            Some(problem) => Err(CutoutError::input(problem)),
            None => Ok(()),
        }
    }
}

/// Outcome of storing one cutout
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub reference: Reference,
    pub encode_ms: u64,
    pub store_ms: u64,
}

/// Generated object key: `{prefix}{stem}-{sha256[..12]}-{uuid[..8]}.png`
#[must_use]
pub fn generate_key(prefix: &str, stem: &str, content_sha256: &str) -> String {
    let digest: String = content_sha256.chars().take(12).collect();
    let nonce: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{prefix}{stem}-{digest}-{nonce}.png")
}

/// Key for the `index`-th cutout of one request when the caller fixed the key
///
/// The first cutout uses the key as given; later ones get `-{index}` before
/// the extension.
#[must_use]
pub fn indexed_key(key: &str, index: usize) -> String {
    if index == 0 {
        return key.to_string();
    }
    let file_start = key.rfind('/').map_or(0, |i| i + 1);
    match key[file_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let split = file_start + dot;
            format!("{}-{index}{}", &key[..split], &key[split..])
        },
        _ => format!("{key}-{index}"),
    }
}

/// Public URL of an object, through the CDN base when one is configured
#[must_use]
pub fn public_url(base: Option<&str>, location: &ObjectLocation) -> String {
    let key = uri_encode(&location.key, false);
    match base.map(|b| b.trim_end_matches('/')).filter(|b| !b.is_empty()) {
        Some(base) => format!("{base}/{key}"),
        None => format!("https://{}.s3.amazonaws.com/{key}", location.bucket),
    }
}

/// Writes cutouts to a blob store and produces references
#[derive(Debug, Clone, Default)]
pub struct Sink {
    store: Option<Arc<dyn BlobStore>>,
}

impl Sink {
    #[must_use]
    pub fn new(store: Option<Arc<dyn BlobStore>>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn BlobStore>> {
        self.store.as_ref()
    }

    fn require_store(&self) -> Result<&Arc<dyn BlobStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| CutoutError::invalid_config("No blob store configured"))
    }

    /// Destination bucket: request, then configuration, then the source's bucket
    fn bucket(
        target: &ObjectTarget,
        storage: &StorageConfig,
        source: &SourceImage,
    ) -> Option<String> {
        target
            .bucket
            .clone()
            .or_else(|| storage.bucket.clone())
            .or_else(|| match source.provenance() {
                Provenance::Object(location) => Some(location.bucket.clone()),
                _ => None,
            })
    }

    fn location(
        target: &ObjectTarget,
        storage: &StorageConfig,
        source: &SourceImage,
        index: usize,
    ) -> Result<ObjectLocation> {
        target.validate()?;
        let bucket = Self::bucket(target, storage, source).ok_or_else(|| {
            CutoutError::invalid_config("No output bucket configured (set OUTPUT_BUCKET)")
        })?;
        let key = match &target.key {
            Some(key) => indexed_key(key, index),
            None => generate_key(
                &storage.prefix,
                &source.provenance().stem(),
                source.content_sha256(),
            ),
        };
        Ok(ObjectLocation::new(bucket, key))
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        png: Vec<u8>,
        storage: &StorageConfig,
    ) -> Result<()> {
        let store = self.require_store()?;
        store
            .put_object(StorageObject {
                location: location.clone(),
                content_type: PNG_CONTENT_TYPE.to_string(),
                cache_control: storage.cache_control.clone(),
                bytes: png,
            })
            .await
    }

    /// Encode `cutout` and deliver it according to `storage.return_mode`
    ///
    /// `inline-binary` writes nothing unless the caller named an explicit key,
    /// in which case a copy is stored there as well.
    ///
    /// # Errors
    /// - `Internal` when PNG encoding fails
    /// - `InvalidConfig` when a write is needed but no store or bucket is configured
    /// - `Storage` for store failures
    pub async fn deliver(
        &self,
        cutout: Cutout,
        source: &SourceImage,
        target: &ObjectTarget,
        storage: &StorageConfig,
        index: usize,
    ) -> Result<Delivered> {
        let encode_start = Instant::now();
        let png = tokio::task::spawn_blocking(move || cutout.to_png())
            .await
            .map_err(|e| CutoutError::internal(format!("Encoding task failed: {e}")))?
            .map_err(|e| CutoutError::internal(format!("PNG encoding failed: {e}")))?;
        let encode_ms = encode_start.elapsed().as_millis() as u64;
        debug!(bytes = png.len(), encode_ms, "Encoded cutout");

        let store_start = Instant::now();
        let reference = match storage.return_mode {
            ReturnMode::InlineBinary => {
                let copy = match (&target.key, self.store.is_some()) {
                    (Some(_), true) => {
                        let location = Self::location(target, storage, source, index)?;
                        self.put(&location, png.clone(), storage).await?;
                        Some(location)
                    },
                    _ => None,
                };
                Reference::Inline { png, copy }
            },
            mode => {
                let location = Self::location(target, storage, source, index)?;
                self.put(&location, png, storage).await?;
                let url = match mode {
                    ReturnMode::Presigned => {
                        self.require_store()?
                            .presign_get(&location, storage.presign_expires)
                            .await?
                    },
                    ReturnMode::S3Uri => location.s3_uri(),
                    _ => public_url(storage.public_base_url.as_deref(), &location),
                };
                Reference::Stored { location, url }
            },
        };
        let store_ms = store_start.elapsed().as_millis() as u64;

        if let Some(location) = reference.location() {
            info!(
                location = %location,
                mode = storage.return_mode.as_str(),
                store_ms,
                "Stored cutout"
            );
        }
        Ok(Delivered {
            reference,
            encode_ms,
            store_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use image::{Rgb, RgbImage, RgbaImage};

    fn source() -> SourceImage {
        SourceImage::new(
            RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])),
            Provenance::Url {
                url: "https://example.com/objects/vase.jpg?size=large".into(),
            },
            "0123456789abcdef0123".into(),
        )
    }

    fn cutout() -> Cutout {
        Cutout::new(RgbaImage::from_fn(4, 3, |x, y| {
            image::Rgba([x as u8, y as u8, 7, if x > 1 { 255 } else { 0 }])
        }))
    }

    fn storage(mode: ReturnMode) -> StorageConfig {
        StorageConfig {
            bucket: Some("media".into()),
            return_mode: mode,
            ..StorageConfig::default()
        }
    }

    fn sink() -> (Sink, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Sink::new(Some(store.clone() as Arc<dyn BlobStore>)), store)
    }

    #[test]
    fn test_generated_key_format() {
        let key = generate_key("cutouts/", "vase", "0123456789abcdef");
        assert!(key.starts_with("cutouts/vase-0123456789ab-"));
        assert!(key.ends_with(".png"));
        let nonce = &key["cutouts/vase-0123456789ab-".len()..key.len() - 4];
        assert_eq!(nonce.len(), 8);
        assert_ne!(key, generate_key("cutouts/", "vase", "0123456789abcdef"));
    }

    #[test]
    fn test_indexed_key() {
        assert_eq!(indexed_key("out/a.png", 0), "out/a.png");
        assert_eq!(indexed_key("out/a.png", 2), "out/a-2.png");
        assert_eq!(indexed_key("out.d/a", 1), "out.d/a-1");
        assert_eq!(indexed_key(".hidden", 1), ".hidden-1");
    }

    #[test]
    fn test_public_url() {
        let location = ObjectLocation::new("media", "cutouts/a b.png");
        assert_eq!(
            public_url(None, &location),
            "https://media.s3.amazonaws.com/cutouts/a%20b.png"
        );
        assert_eq!(
            public_url(Some("https://cdn.example.com/"), &location),
            "https://cdn.example.com/cutouts/a%20b.png"
        );
    }

    #[tokio::test]
    async fn test_presigned_reference_and_object_metadata() {
        let (sink, store) = sink();
        let delivered = sink
            .deliver(
                cutout(),
                &source(),
                &ObjectTarget::default(),
                &storage(ReturnMode::Presigned),
                0,
            )
            .await
            .unwrap();

        let location = delivered.reference.location().unwrap().clone();
        assert!(location.key.starts_with("cutouts/vase-0123456789ab-"));
        assert!(delivered.reference.url().unwrap().contains("X-Amz-Expires=3600"));

        let object = store.object(&location).await.unwrap();
        assert_eq!(object.content_type, "image/png");
        assert_eq!(object.cache_control, "public, max-age=31536000, immutable");
        let decoded = image::load_from_memory(&object.bytes).unwrap().to_rgba8();
        assert_eq!(&decoded, cutout().image());
    }

    #[tokio::test]
    async fn test_inline_binary_writes_nothing() {
        let (sink, store) = sink();
        let delivered = sink
            .deliver(
                cutout(),
                &source(),
                &ObjectTarget::default(),
                &storage(ReturnMode::InlineBinary),
                0,
            )
            .await
            .unwrap();

        assert_eq!(store.write_count(), 0);
        match delivered.reference {
            Reference::Inline { png, copy } => {
                assert!(copy.is_none());
                assert!(png.starts_with(b"\x89PNG"));
            },
            other => panic!("expected inline reference, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inline_with_explicit_key_stores_copy() {
        let (sink, store) = sink();
        let target = ObjectTarget {
            bucket: Some("archive".into()),
            key: Some("fixed/vase.png".into()),
        };
        let delivered = sink
            .deliver(cutout(), &source(), &target, &storage(ReturnMode::InlineBinary), 0)
            .await
            .unwrap();

        assert_eq!(
            delivered.reference.location(),
            Some(&ObjectLocation::new("archive", "fixed/vase.png"))
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_key_overwrites() {
        let (sink, store) = sink();
        let target = ObjectTarget {
            bucket: None,
            key: Some("fixed/vase.png".into()),
        };
        for _ in 0..2 {
            let delivered = sink
                .deliver(cutout(), &source(), &target, &storage(ReturnMode::S3Uri), 0)
                .await
                .unwrap();
            assert_eq!(delivered.reference.url(), Some("s3://media/fixed/vase.png"));
        }
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.locations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_source_bucket_fallback_and_public_url() {
        let (sink, _store) = sink();
        let object_source = SourceImage::new(
            RgbImage::new(2, 2),
            Provenance::Object(ObjectLocation::new("uploads", "in/photo.jpeg")),
            "ffffffffffffffff".into(),
        );
        let storage = StorageConfig {
            bucket: None,
            return_mode: ReturnMode::PublicUrl,
            ..StorageConfig::default()
        };
        let delivered = sink
            .deliver(cutout(), &object_source, &ObjectTarget::default(), &storage, 0)
            .await
            .unwrap();
        let url = delivered.reference.url().unwrap();
        assert!(url.starts_with("https://uploads.s3.amazonaws.com/cutouts/photo-ffffffffffff-"));
    }

    #[tokio::test]
    async fn test_missing_bucket_or_store_is_config_error() {
        let (sink, _store) = sink();
        let no_bucket = StorageConfig {
            bucket: None,
            ..StorageConfig::default()
        };
        let result = sink
            .deliver(cutout(), &source(), &ObjectTarget::default(), &no_bucket, 0)
            .await;
        assert!(matches!(result, Err(CutoutError::InvalidConfig(_))));

        let result = Sink::new(None)
            .deliver(
                cutout(),
                &source(),
                &ObjectTarget::default(),
                &storage(ReturnMode::S3Uri),
                0,
            )
            .await;
        assert!(matches!(result, Err(CutoutError::InvalidConfig(_))));
    }

    #[test]
    fn test_target_validation() {
        let target = |bucket: Option<&str>, key: Option<&str>| ObjectTarget {
            bucket: bucket.map(String::from),
            key: key.map(String::from),
        };
        assert!(ObjectTarget::default().validate().is_ok());
        assert!(target(Some("media"), Some("room-4/vase.png")).validate().is_ok());

        for bad in [
            target(None, Some("a/../b")),
            target(None, Some("/etc/x")),
            target(None, Some("")),
            target(Some("a/b"), None),
            target(Some(""), Some("k.png")),
        ] {
            let err = bad.validate().unwrap_err();
            assert_eq!(err.kind(), "invalid_input", "{bad:?}");
            assert_eq!(err.status_code(), 400);
        }
    }

    #[tokio::test]
    async fn test_traversal_key_is_client_error() {
        let (sink, store) = sink();
        let target = ObjectTarget {
            bucket: None,
            key: Some("a/../../b.png".into()),
        };
        let err = sink
            .deliver(cutout(), &source(), &target, &storage(ReturnMode::S3Uri), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Input(_)));
        assert_eq!(store.write_count(), 0);
    }
}
