//! Core types flowing through one cutout invocation

use crate::config::{
    AlphaMode, CutoutScope, NoDetectionPolicy, PipelineConfig, ResampleFilter, ReturnMode,
    SegmenterKind,
};
use crate::error::{CutoutError, Result};
use image::{ImageBuffer, Luma, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Bucket and key of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `s3://bucket/key`
    ///
    /// # Errors
    /// - Wrong scheme, or bucket or key missing
    pub fn parse_s3_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| CutoutError::input(format!("Not an s3:// URI: {uri}")))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            },
            _ => Err(CutoutError::input(format!(
                "s3 URI must name a bucket and a key: {uri}"
            ))),
        }
    }

    #[must_use]
    pub fn s3_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.s3_uri())
    }
}

/// Where a source image came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Provenance {
    Url { url: String },
    Object(ObjectLocation),
    Inline { len: usize },
}

impl Provenance {
    /// Basename without extension, used to derive output keys
    #[must_use]
    pub fn stem(&self) -> String {
        let path = match self {
            Self::Url { url } => {
                let without_query = url.split(['?', '#']).next().unwrap_or_default();
                let path = without_query
                    .split_once("://")
                    .map_or(without_query, |(_, rest)| {
                        rest.split_once('/').map_or("", |(_, path)| path)
                    });
                path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
            },
            Self::Object(location) => location.key.rsplit('/').next().unwrap_or_default(),
            Self::Inline { .. } => "",
        };
        let stem = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        let sanitized: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if sanitized.is_empty() {
            "image".to_string()
        } else {
            sanitized
        }
    }
}

/// Decoded input image, never mutated after decode
#[derive(Debug, Clone)]
pub struct SourceImage {
    image: RgbImage,
    provenance: Provenance,
    content_sha256: String,
}

impl SourceImage {
    /// Wrap decoded pixels together with their provenance and input digest
    #[must_use]
    pub fn new(image: RgbImage, provenance: Provenance, content_sha256: String) -> Self {
        Self {
            image,
            provenance,
            content_sha256,
        }
    }

    /// Source image for tests and in-process callers without original bytes
    #[must_use]
    pub fn from_rgb(image: RgbImage) -> Self {
        use sha2::{Digest, Sha256};
        let digest = format!("{:x}", Sha256::digest(image.as_raw()));
        let len = image.as_raw().len();
        Self::new(image, Provenance::Inline { len }, digest)
    }

    #[must_use]
    pub fn rgb(&self) -> &RgbImage {
        &self.image
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Hex SHA-256 of the original input bytes
    #[must_use]
    pub fn content_sha256(&self) -> &str {
        &self.content_sha256
    }
}

/// Per-pixel soft membership in `[0, 1]` plus optional ranking signals
///
/// A mask may be smaller or larger than the image it was produced for; the
/// compositor resamples it. `area` is measured in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<f32>,
    area: Option<f64>,
    confidence: Option<f32>,
}

impl Mask {
    /// Create a mask from row-major values; non-finite values become 0
    ///
    /// # Errors
    /// - Data length does not match `width * height`
    /// - Zero-sized dimensions
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CutoutError::inference(format!(
                "Mask dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(CutoutError::inference(format!(
                "Mask data length {} does not match {width}x{height}",
                data.len()
            )));
        }
        let data = data
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Ok(Self {
            width,
            height,
            data,
            area: None,
            confidence: None,
        })
    }

    /// Build a mask by evaluating `f(x, y)` for every pixel
    pub fn from_fn<F: Fn(u32, u32) -> f32>(width: u32, height: u32, f: F) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let v = f(x, y);
                data.push(if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 });
            }
        }
        Self {
            width,
            height,
            data,
            area: None,
            confidence: None,
        }
    }

    /// Uniform mask
    #[must_use]
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self::from_fn(width, height, |_, _| value)
    }

    /// Axis-aligned rectangle of full membership, `x0..x1` by `y0..y1`
    #[must_use]
    pub fn rect(width: u32, height: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self::from_fn(width, height, |x, y| {
            if x >= x0 && x < x1 && y >= y0 && y < y1 {
                1.0
            } else {
                0.0
            }
        })
    }

    #[must_use]
    pub fn with_area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach `area` measured as covered pixels, scaled to a source of `source_dims`
    #[must_use]
    pub fn with_measured_area(self, source_dims: (u32, u32)) -> Self {
        let covered = self.coverage(0.5) as f64;
        let scale = (f64::from(source_dims.0) * f64::from(source_dims.1))
            / (f64::from(self.width) * f64::from(self.height));
        self.with_area(covered * scale)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn area(&self) -> Option<f64> {
        self.area
    }

    #[must_use]
    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    /// Value at `(x, y)`, 0 outside the mask
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        let index = y as usize * self.width as usize + x as usize;
        self.data.get(index).copied().unwrap_or(0.0)
    }

    /// Number of pixels strictly above `threshold`
    #[must_use]
    pub fn coverage(&self, threshold: f32) -> usize {
        self.data.iter().filter(|&&v| v > threshold).count()
    }

    /// Intersection over union of the binarized masks (0 when shapes differ)
    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        if self.dimensions() != other.dimensions() {
            return 0.0;
        }
        let (mut intersection, mut union) = (0usize, 0usize);
        for (&a, &b) in self.data.iter().zip(&other.data) {
            let (a, b) = (a > 0.5, b > 0.5);
            if a && b {
                intersection += 1;
            }
            if a || b {
                union += 1;
            }
        }
        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    /// Resample to new dimensions, keeping the ranking signals
    #[must_use]
    pub fn resize(&self, width: u32, height: u32, filter: ResampleFilter) -> Self {
        if (width, height) == self.dimensions() {
            return self.clone();
        }
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(self.width, self.height, |x, y| Luma([self.get(x, y)]));
        let resized = image::imageops::resize(&buffer, width, height, filter.to_filter_type());
        let data = resized
            .into_raw()
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Self {
            width,
            height,
            data,
            area: self.area,
            confidence: self.confidence,
        }
    }
}

/// RGBA result with the source's dimensions
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    image: RgbaImage,
}

impl Cutout {
    #[must_use]
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    #[must_use]
    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Pixels with alpha below 255
    #[must_use]
    pub fn transparent_pixel_count(&self) -> usize {
        self.image.pixels().filter(|p| p.0[3] < 255).count()
    }

    /// Lossless PNG encoding
    ///
    /// # Errors
    /// - Encoder failure
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buffer);
        self.image.write_to(&mut cursor, image::ImageFormat::Png)?;
        Ok(buffer)
    }
}

/// Object written to a blob store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub location: ObjectLocation,
    pub content_type: String,
    pub cache_control: String,
    pub bytes: Vec<u8>,
}

/// Retrievable handle to one stored (or inline) cutout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Object in a store, addressed by presigned, `s3://` or public URL
    Stored { location: ObjectLocation, url: String },
    /// PNG bytes returned directly; `copy` is set when an explicit key was also written
    Inline {
        png: Vec<u8>,
        copy: Option<ObjectLocation>,
    },
}

impl Reference {
    #[must_use]
    pub fn location(&self) -> Option<&ObjectLocation> {
        match self {
            Self::Stored { location, .. } => Some(location),
            Self::Inline { copy, .. } => copy.as_ref(),
        }
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Stored { url, .. } => Some(url),
            Self::Inline { .. } => None,
        }
    }
}

/// Timing breakdown for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Model loading time (cold start only)
    pub model_load_ms: u64,
    /// Remote fetch or object read
    pub fetch_ms: u64,
    pub decode_ms: u64,
    /// Segmenter time including pre/postprocessing
    pub inference_ms: u64,
    pub selection_ms: u64,
    pub compositing_ms: u64,
    pub encode_ms: u64,
    pub store_ms: u64,
    pub total_ms: u64,
}

/// Effective tuning echoed back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUsed {
    pub segmenter: SegmenterKind,
    pub policy: String,
    pub scope: CutoutScope,
    pub no_detection: NoDetectionPolicy,
    pub conf: f32,
    pub iou: f32,
    pub max_det: usize,
    pub imgsz: u32,
    pub retina_masks: bool,
    pub resample_filter: ResampleFilter,
    pub alpha_mode: AlphaMode,
    pub return_mode: ReturnMode,
    pub presign_expires: u64,
}

impl ConfigUsed {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            segmenter: config.segmenter,
            policy: config.effective_policy().name().to_string(),
            scope: config.scope,
            no_detection: config.no_detection,
            conf: config.detection.conf,
            iou: config.detection.iou,
            max_det: config.detection.max_det,
            imgsz: config.detection.imgsz,
            retina_masks: config.detection.retina_masks,
            resample_filter: config.resample_filter,
            alpha_mode: config.alpha_mode,
            return_mode: config.storage.return_mode,
            presign_expires: config.storage.presign_expires,
        }
    }
}

/// Everything a caller may want to log about a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub config_used: ConfigUsed,
    pub timings: ProcessingTimings,
    /// The source was stored unmodified because nothing was detected
    pub passed_through: bool,
}

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum CutoutOutcome {
    /// One reference per cutout (possibly none under the `empty` policy)
    Stored {
        references: Vec<Reference>,
        detected_count: usize,
        diagnostics: Diagnostics,
    },
    /// The selector found nothing and the policy is `reject`
    NoDetection {
        detected_count: usize,
        diagnostics: Diagnostics,
    },
}

impl CutoutOutcome {
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        match self {
            Self::Stored { diagnostics, .. } | Self::NoDetection { diagnostics, .. } => {
                diagnostics
            },
        }
    }

    #[must_use]
    pub fn detected_count(&self) -> usize {
        match self {
            Self::Stored { detected_count, .. } | Self::NoDetection { detected_count, .. } => {
                *detected_count
            },
        }
    }

    #[must_use]
    pub fn references(&self) -> &[Reference] {
        match self {
            Self::Stored { references, .. } => references,
            Self::NoDetection { .. } => &[],
        }
    }

    #[must_use]
    pub fn is_no_detection(&self) -> bool {
        matches!(self, Self::NoDetection { .. })
    }
}
