//! Input resolution: URL fetch, storage reads and decoding
//!
//! Every accepted source ends up as an RGB [`SourceImage`]. Transport problems
//! (unreachable host, non-2xx status, missing object) are fetch errors; bytes
//! that are not an image are decode errors.

use crate::config::PipelineConfig;
use crate::error::{CutoutError, Result};
use crate::store::BlobStore;
use crate::types::{ObjectLocation, Provenance, SourceImage};
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

// Use instant crate for cross-platform time compatibility
use instant::Instant;

/// Where the image to cut out comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Remote `http(s)://` URL
    Url(String),
    /// Object in the configured blob store
    Object(ObjectLocation),
    /// Raw encoded bytes
    Bytes(Vec<u8>),
}

impl ImageSource {
    /// Classify a textual reference: `s3://bucket/key` or an HTTP(S) URL
    ///
    /// # Errors
    /// - Malformed `s3://` URI or unsupported scheme
    pub fn from_reference(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.starts_with("s3://") {
            return ObjectLocation::parse_s3_uri(reference).map(Self::Object);
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(Self::Url(reference.to_string()));
        }
        Err(CutoutError::input(format!(
            "Unsupported image reference '{reference}' (expected http(s):// or s3://)"
        )))
    }

    fn provenance(&self) -> Provenance {
        match self {
            Self::Url(url) => Provenance::Url { url: url.clone() },
            Self::Object(location) => Provenance::Object(location.clone()),
            Self::Bytes(bytes) => Provenance::Inline { len: bytes.len() },
        }
    }
}

/// Decoded source plus how long getting it took
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub image: SourceImage,
    pub fetch_ms: u64,
    pub decode_ms: u64,
}

/// Turns an [`ImageSource`] into a [`SourceImage`]
#[derive(Debug, Clone)]
pub struct InputResolver {
    client: Client,
    store: Option<Arc<dyn BlobStore>>,
    max_image_bytes: usize,
}

impl InputResolver {
    /// # Errors
    /// - HTTP client construction failure
    pub fn new(fetch_timeout: Duration, max_image_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| CutoutError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            store: None,
            max_image_bytes,
        })
    }

    /// # Errors
    /// - HTTP client construction failure
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            Duration::from_secs(config.fetch_timeout_secs),
            config.max_image_bytes,
        )
    }

    /// Store used for object sources
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fetch (if needed) and decode a source
    ///
    /// # Errors
    /// - `Fetch` when a URL or object cannot be retrieved
    /// - `Input` when the payload exceeds the size limit
    /// - `Decode` when the bytes are not an image
    #[instrument(skip(self, source), fields(source = %source_label(source)))]
    pub async fn resolve(&self, source: &ImageSource) -> Result<ResolvedImage> {
        let fetch_start = Instant::now();
        let bytes = match source {
            ImageSource::Url(url) => self.fetch_url(url).await?,
            ImageSource::Object(location) => self.fetch_object(location).await?,
            ImageSource::Bytes(bytes) => bytes.clone(),
        };
        let fetch_ms = fetch_start.elapsed().as_millis() as u64;

        if bytes.len() > self.max_image_bytes {
            return Err(CutoutError::input(format!(
                "Image is {} bytes, limit is {}",
                bytes.len(),
                self.max_image_bytes
            )));
        }

        let decode_start = Instant::now();
        let image = Self::decode(&bytes, source.provenance())?;
        let decode_ms = decode_start.elapsed().as_millis() as u64;

        info!(
            width = image.width(),
            height = image.height(),
            bytes = bytes.len(),
            fetch_ms,
            decode_ms,
            "Resolved source image"
        );
        Ok(ResolvedImage {
            image,
            fetch_ms,
            decode_ms,
        })
    }

    /// Decode bytes into a 3-channel image regardless of source layout
    ///
    /// # Errors
    /// - `Decode` for empty or unrecognized data
    pub fn decode(bytes: &[u8], provenance: Provenance) -> Result<SourceImage> {
        if bytes.is_empty() {
            return Err(CutoutError::decode("Image payload is empty"));
        }
        let format = image::guess_format(bytes)
            .map_err(|e| CutoutError::decode(format!("Unrecognized image data: {e}")))?;
        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| CutoutError::decode(format!("Failed to decode {format:?} image: {e}")))?;
        debug!(?format, color = ?decoded.color(), "Decoded image");

        let digest = format!("{:x}", Sha256::digest(bytes));
        Ok(SourceImage::new(decoded.to_rgb8(), provenance, digest))
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "Fetching image");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CutoutError::fetch(format!("Failed to fetch {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CutoutError::fetch(format!("HTTP {status} fetching {url}")));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_image_bytes as u64 {
                return Err(CutoutError::input(format!(
                    "Image is {length} bytes, limit is {}",
                    self.max_image_bytes
                )));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| CutoutError::fetch(format!("Failed reading {url}: {e}")))?;
            body.extend_from_slice(&chunk);
            if body.len() > self.max_image_bytes {
                return Err(CutoutError::input(format!(
                    "Image exceeds the {} byte limit",
                    self.max_image_bytes
                )));
            }
        }
        Ok(body)
    }

    async fn fetch_object(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        let store = self.store.as_ref().ok_or_else(|| {
            CutoutError::input(format!("No blob store configured to read {location}"))
        })?;
        match store.get_object(location).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(CutoutError::fetch(format!("Object {location} does not exist"))),
            Err(e) => Err(CutoutError::fetch(format!("Failed to read {location}: {e}"))),
        }
    }
}

fn source_label(source: &ImageSource) -> String {
    match source {
        ImageSource::Url(url) => url.clone(),
        ImageSource::Object(location) => location.s3_uri(),
        ImageSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage, RgbaImage};

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut buffer), format)
            .unwrap();
        buffer
    }

    fn resolver() -> InputResolver {
        InputResolver::new(Duration::from_secs(5), 1024 * 1024).unwrap()
    }

    #[test]
    fn test_from_reference() {
        assert_eq!(
            ImageSource::from_reference("s3://in/a.jpg").unwrap(),
            ImageSource::Object(ObjectLocation::new("in", "a.jpg"))
        );
        assert_eq!(
            ImageSource::from_reference(" https://x/y.png ").unwrap(),
            ImageSource::Url("https://x/y.png".into())
        );
        assert!(ImageSource::from_reference("ftp://x/y.png").is_err());
    }

    #[tokio::test]
    async fn test_decodes_jpeg_to_rgb() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([10, 200, 30])));
        let bytes = encode(&image, ImageFormat::Jpeg);

        let resolved = resolver().resolve(&ImageSource::Bytes(bytes)).await.unwrap();
        assert_eq!(resolved.image.dimensions(), (40, 30));
        assert_eq!(resolved.image.rgb().as_raw().len(), 40 * 30 * 3);
    }

    #[tokio::test]
    async fn test_decodes_grayscale_and_rgba_png() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(9, 7, Luma([77])));
        let resolved = resolver()
            .resolve(&ImageSource::Bytes(encode(&gray, ImageFormat::Png)))
            .await
            .unwrap();
        assert_eq!(resolved.image.dimensions(), (9, 7));
        assert_eq!(resolved.image.rgb().get_pixel(3, 3), &Rgb([77, 77, 77]));

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(5, 6, image::Rgba([1, 2, 3, 0])));
        let resolved = resolver()
            .resolve(&ImageSource::Bytes(encode(&rgba, ImageFormat::Png)))
            .await
            .unwrap();
        assert_eq!(resolved.image.dimensions(), (5, 6));
        assert_eq!(resolved.image.rgb().get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    /// 8-bit indexed PNG with an uncompressed (stored) zlib stream
    fn palette_png(
        width: u32,
        height: u32,
        palette: &[[u8; 3]],
        index: impl Fn(u32, u32) -> u8,
    ) -> Vec<u8> {
        fn crc32(bytes: &[u8]) -> u32 {
            let mut crc = 0xFFFF_FFFFu32;
            for &byte in bytes {
                crc ^= u32::from(byte);
                for _ in 0..8 {
                    crc = if crc & 1 == 1 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
                }
            }
            !crc
        }
        fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            let mut body = kind.to_vec();
            body.extend_from_slice(data);
            out.extend_from_slice(&body);
            out.extend_from_slice(&crc32(&body).to_be_bytes());
        }

        let mut raw = Vec::new();
        for y in 0..height {
            raw.push(0); // filter: none
            raw.extend((0..width).map(|x| index(x, y)));
        }
        let (mut a, mut b) = (1u32, 0u32);
        for &byte in &raw {
            a = (a + u32::from(byte)) % 65_521;
            b = (b + a) % 65_521;
        }
        let len = raw.len() as u16;
        let mut zlib = vec![0x78, 0x01, 0x01];
        zlib.extend_from_slice(&len.to_le_bytes());
        zlib.extend_from_slice(&(!len).to_le_bytes());
        zlib.extend_from_slice(&raw);
        zlib.extend_from_slice(&((b << 16) | a).to_be_bytes());

        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[8, 3, 0, 0, 0]);

        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        chunk(&mut png, b"IHDR", &ihdr);
        chunk(&mut png, b"PLTE", &palette.concat());
        chunk(&mut png, b"IDAT", &zlib);
        chunk(&mut png, b"IEND", &[]);
        png
    }

    #[tokio::test]
    async fn test_decodes_palette_png_to_rgb() {
        let palette = [[200, 10, 10], [10, 10, 200]];
        let bytes = palette_png(5, 3, &palette, |x, _| u8::from(x >= 2));
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);

        let resolved = resolver().resolve(&ImageSource::Bytes(bytes)).await.unwrap();
        let rgb = resolved.image.rgb();
        assert_eq!(resolved.image.dimensions(), (5, 3));
        assert_eq!(rgb.as_raw().len(), 5 * 3 * 3);
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([200, 10, 10]));
        assert_eq!(rgb.get_pixel(4, 2), &Rgb([10, 10, 200]));
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let err = resolver()
            .resolve(&ImageSource::Bytes(b"definitely not an image".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Decode(_)));
        assert_eq!(err.status_code(), 400);

        let err = resolver()
            .resolve(&ImageSource::Bytes(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "decode_failed");
    }

    #[tokio::test]
    async fn test_size_limit() {
        let resolver = InputResolver::new(Duration::from_secs(5), 16).unwrap();
        let err = resolver
            .resolve(&ImageSource::Bytes(vec![0; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Input(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_fetch_error() {
        let err = resolver()
            .resolve(&ImageSource::Url("http://127.0.0.1:1/image.jpg".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Fetch(_)));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_object_source_reads_store() {
        let store = Arc::new(MemoryStore::new());
        let png = encode(
            &DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([9, 9, 9]))),
            ImageFormat::Png,
        );
        store.insert("in", "uploads/toy.png", png).await;

        let resolver = resolver().with_store(store);
        let resolved = resolver
            .resolve(&ImageSource::Object(ObjectLocation::new("in", "uploads/toy.png")))
            .await
            .unwrap();
        assert_eq!(resolved.image.dimensions(), (3, 2));
        assert_eq!(resolved.image.provenance().stem(), "toy");

        let err = resolver
            .resolve(&ImageSource::Object(ObjectLocation::new("in", "missing.png")))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_object_source_without_store_is_input_error() {
        let err = resolver()
            .resolve(&ImageSource::Object(ObjectLocation::new("in", "a.png")))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoutError::Input(_)));
    }
}
