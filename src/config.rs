//! Configuration types for cutout pipeline operations

use crate::error::{CutoutError, Result};
use crate::models::ModelSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon GPU acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown execution provider '{other}' (expected auto, cpu, cuda or coreml)"
            ))),
        }
    }
}

/// Inference engine used to run the ONNX graphs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// ONNX Runtime backend (supports GPU acceleration)
    Onnx,
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Tract
        }
    }
}

impl FromStr for BackendType {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "tract" => Ok(Self::Tract),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown backend '{other}' (expected onnx or tract)"
            ))),
        }
    }
}

/// Segmentation strategy behind the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SegmenterKind {
    /// Salient-object model producing exactly one foreground mask
    Foreground,
    /// Point-prompted encoder/decoder producing exactly one mask
    Prompted,
    /// Grid-prompted proposal producing many masks with area
    Automatic,
    /// Detector with per-instance masks and confidence
    #[default]
    Detection,
}

impl SegmenterKind {
    /// Selection policy used when none is configured explicitly
    #[must_use]
    pub fn default_policy(self) -> SelectionPolicy {
        match self {
            Self::Automatic => SelectionPolicy::Area,
            Self::Foreground | Self::Prompted | Self::Detection => SelectionPolicy::default(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Prompted => "prompted",
            Self::Automatic => "automatic",
            Self::Detection => "detection",
        }
    }
}

impl std::fmt::Display for SegmenterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmenterKind {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "foreground" | "rembg" => Ok(Self::Foreground),
            "prompted" | "point" => Ok(Self::Prompted),
            "automatic" | "auto" => Ok(Self::Automatic),
            "detection" | "yolo" => Ok(Self::Detection),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown segmenter '{other}' \
                 (expected foreground, prompted, automatic or detection)"
            ))),
        }
    }
}

/// Default confidence floor for the salience policy
pub const DEFAULT_SALIENCE_EPSILON: f32 = 0.01;

/// Rule used to rank candidate masks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// `area * max(confidence, epsilon)`
    Salience { epsilon: f32 },
    /// Area alone
    Area,
    /// Confidence alone
    Confidence,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::Salience {
            epsilon: DEFAULT_SALIENCE_EPSILON,
        }
    }
}

impl SelectionPolicy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Salience { .. } => "salience",
            Self::Area => "area",
            Self::Confidence => "confidence",
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "salience" | "area-confidence" => Ok(Self::default()),
            "area" => Ok(Self::Area),
            "confidence" | "score" => Ok(Self::Confidence),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown selection policy '{other}' (expected salience, area or confidence)"
            ))),
        }
    }
}

/// How many candidates become cutouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CutoutScope {
    /// Only the top-ranked candidate
    #[default]
    Best,
    /// Every candidate, in ranked order
    All,
}

impl FromStr for CutoutScope {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "best" | "one" => Ok(Self::Best),
            "all" => Ok(Self::All),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown cutout scope '{other}' (expected best or all)"
            ))),
        }
    }
}

/// What to do when the selector finds nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoDetectionPolicy {
    /// Report a distinct no-detection outcome (422-style)
    #[default]
    Reject,
    /// Store the source image unmodified and fully opaque
    PassThrough,
    /// Succeed with zero stored references
    Empty,
}

impl FromStr for NoDetectionPolicy {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "pass-through" | "passthrough" => Ok(Self::PassThrough),
            "empty" => Ok(Self::Empty),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown no-detection policy '{other}' (expected reject, pass-through or empty)"
            ))),
        }
    }
}

/// Filter used when a mask has to be resampled to the image size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleFilter {
    /// Nearest neighbour, no partial alpha along hard edges
    Nearest,
    /// Bilinear interpolation
    #[default]
    Bilinear,
}

impl ResampleFilter {
    #[must_use]
    pub fn to_filter_type(self) -> image::imageops::FilterType {
        match self {
            Self::Nearest => image::imageops::FilterType::Nearest,
            Self::Bilinear => image::imageops::FilterType::Triangle,
        }
    }
}

impl FromStr for ResampleFilter {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "bilinear" | "linear" | "triangle" => Ok(Self::Bilinear),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown resample filter '{other}' (expected nearest or bilinear)"
            ))),
        }
    }
}

/// Default binarization threshold, as a fraction of the mask range
pub const DEFAULT_ALPHA_THRESHOLD: f32 = 0.5;

/// How mask values become alpha
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AlphaMode {
    /// `value > threshold` is opaque, everything else transparent
    Binary { threshold: f32 },
    /// Alpha is the mask value scaled to 0-255
    Soft,
}

impl Default for AlphaMode {
    fn default() -> Self {
        Self::Binary {
            threshold: DEFAULT_ALPHA_THRESHOLD,
        }
    }
}

impl FromStr for AlphaMode {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "hard" => Ok(Self::default()),
            "soft" | "feather" => Ok(Self::Soft),
            other => Err(CutoutError::invalid_config(format!(
                "Unknown alpha mode '{other}' (expected binary or soft)"
            ))),
        }
    }
}

/// How the stored result is referenced in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnMode {
    /// Time-bounded presigned GET URL
    #[default]
    Presigned,
    /// `s3://bucket/key`
    S3Uri,
    /// Public (or CDN-prefixed) URL
    PublicUrl,
    /// PNG bytes returned inline, nothing is stored
    InlineBinary,
}

impl ReturnMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presigned => "presigned",
            Self::S3Uri => "s3-uri",
            Self::PublicUrl => "public-url",
            Self::InlineBinary => "inline-binary",
        }
    }
}

impl FromStr for ReturnMode {
    type Err = CutoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "presigned" => Ok(Self::Presigned),
            "s3-uri" | "s3" => Ok(Self::S3Uri),
            "public-url" | "public" | "cdn" => Ok(Self::PublicUrl),
            "inline-binary" | "inline" | "binary" => Ok(Self::InlineBinary),
            other => Err(CutoutError::input(format!(
                "Unknown return mode '{other}' \
                 (expected presigned, s3-uri, public-url or inline-binary)"
            ))),
        }
    }
}

/// Tuning for the detection+segmentation variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Minimum confidence for a detection to be kept
    pub conf: f32,
    /// IoU above which overlapping detections are suppressed
    pub iou: f32,
    /// Maximum number of detections returned
    pub max_det: usize,
    /// Square inference resolution
    pub imgsz: u32,
    /// Render masks at inference resolution instead of prototype resolution
    pub retina_masks: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            conf: 0.25,
            iou: 0.45,
            max_det: 10,
            imgsz: 640,
            retina_masks: true,
        }
    }
}

/// Tuning for the full-foreground variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForegroundParams {
    /// Square model input size
    pub input_size: u32,
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
    /// Stretch raw predictions to the full 0-1 range before use
    pub normalize_prediction: bool,
}

impl Default for ForegroundParams {
    fn default() -> Self {
        Self {
            input_size: 320,
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
            normalize_prediction: true,
        }
    }
}

/// Tuning for the point-prompted variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PromptParams {
    /// Prompt point in source pixels; `None` means the image center
    pub point: Option<(f32, f32)>,
}

/// Tuning for the automatic multi-mask variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMaskParams {
    /// Grid resolution, `points_per_side²` prompts per image
    pub points_per_side: u32,
    /// Minimum predicted IoU for a proposal
    pub pred_iou_thresh: f32,
    /// Minimum stability score for a proposal
    pub stability_score_thresh: f32,
    /// Logit offset used for the stability score
    pub stability_score_offset: f32,
    /// Mask IoU above which proposals are considered duplicates
    pub dedup_iou_thresh: f32,
    /// Proposals smaller than this many source pixels are dropped
    pub min_area: f64,
}

impl Default for AutoMaskParams {
    fn default() -> Self {
        Self {
            points_per_side: 16,
            pred_iou_thresh: 0.88,
            stability_score_thresh: 0.95,
            stability_score_offset: 1.0,
            dedup_iou_thresh: 0.7,
            min_area: 64.0,
        }
    }
}

/// Where and how results are stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Destination bucket (falls back to the source bucket for object inputs)
    pub bucket: Option<String>,
    /// Prefix for generated keys
    pub prefix: String,
    /// CDN or custom domain used for public URLs
    pub public_base_url: Option<String>,
    pub return_mode: ReturnMode,
    /// Validity window of presigned URLs in seconds
    pub presign_expires: u64,
    /// `Cache-Control` written with every object
    pub cache_control: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: "cutouts/".to_string(),
            public_base_url: None,
            return_mode: ReturnMode::default(),
            presign_expires: 3600,
            cache_control: "public, max-age=31536000, immutable".to_string(),
        }
    }
}

/// Largest detector input edge; the letterboxed canvas is `imgsz * imgsz` pixels
pub const MAX_IMGSZ: u32 = 4096;

/// Longest presigned URL validity accepted by S3-compatible stores
pub const MAX_PRESIGN_EXPIRES: u64 = 604_800;

/// Configuration for a cutout pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub segmenter: SegmenterKind,

    /// Inference engine
    pub backend_type: BackendType,

    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,

    /// Number of inter-op threads for inference (0 = auto)
    pub inter_threads: usize,

    /// Model weights; `None` picks the default for the segmenter kind
    pub model_spec: Option<ModelSpec>,

    /// Directory holding bundled model files
    pub model_dir: PathBuf,

    /// Ranking rule; `None` picks the default for the segmenter kind
    pub selection_policy: Option<SelectionPolicy>,

    pub scope: CutoutScope,
    pub no_detection: NoDetectionPolicy,
    pub resample_filter: ResampleFilter,
    pub alpha_mode: AlphaMode,

    pub detection: DetectionParams,
    pub foreground: ForegroundParams,
    pub prompt: PromptParams,
    pub auto_masks: AutoMaskParams,

    pub storage: StorageConfig,

    /// Timeout for remote image fetches in seconds
    pub fetch_timeout_secs: u64,

    /// Largest accepted source image in bytes
    pub max_image_bytes: usize,

    /// Enable debug mode (additional logging)
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterKind::default(),
            backend_type: BackendType::default(),
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            inter_threads: 0,
            model_spec: None,
            model_dir: PathBuf::from("models"),
            selection_policy: None,
            scope: CutoutScope::default(),
            no_detection: NoDetectionPolicy::default(),
            resample_filter: ResampleFilter::default(),
            alpha_mode: AlphaMode::default(),
            detection: DetectionParams::default(),
            foreground: ForegroundParams::default(),
            prompt: PromptParams::default(),
            auto_masks: AutoMaskParams::default(),
            storage: StorageConfig::default(),
            fetch_timeout_secs: 30,
            max_image_bytes: 25 * 1024 * 1024,
            debug: false,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder for fluent API construction
    ///
    /// # Examples
    ///
    /// ```rust
    /// use museum_cutout::config::{PipelineConfig, ReturnMode, SegmenterKind};
    ///
    /// let config = PipelineConfig::builder()
    ///     .segmenter(SegmenterKind::Automatic)
    ///     .return_mode(ReturnMode::S3Uri)
    ///     .bucket("scrapbook-media")
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.effective_policy().name(), "area");
    /// ```
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Selection policy in force, explicit or derived from the segmenter kind
    #[must_use]
    pub fn effective_policy(&self) -> SelectionPolicy {
        self.selection_policy
            .unwrap_or_else(|| self.segmenter.default_policy())
    }

    /// Model weights in force, explicit or the default for the segmenter kind
    #[must_use]
    pub fn effective_model_spec(&self) -> ModelSpec {
        self.model_spec
            .clone()
            .unwrap_or_else(|| ModelSpec::default_for(self.segmenter))
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Thresholds outside 0.0-1.0
    /// - Zero `max_det`, `imgsz`, grid size or fetch timeout
    /// - `imgsz` not a multiple of 32 or above [`MAX_IMGSZ`]
    /// - Presign expiry outside 1-604800 seconds
    pub fn validate(&self) -> Result<()> {
        let unit_ranges = [
            ("conf", self.detection.conf),
            ("iou", self.detection.iou),
            ("pred_iou_thresh", self.auto_masks.pred_iou_thresh),
            ("stability_score_thresh", self.auto_masks.stability_score_thresh),
            ("dedup_iou_thresh", self.auto_masks.dedup_iou_thresh),
        ];
        for (name, value) in unit_ranges {
            if !(0.0..=1.0).contains(&value) {
                return Err(CutoutError::config_value_error(name, value, "0.0-1.0", None));
            }
        }

        if let AlphaMode::Binary { threshold } = self.alpha_mode {
            if !(0.0..1.0).contains(&threshold) {
                return Err(CutoutError::config_value_error(
                    "alpha threshold",
                    threshold,
                    "0.0-<1.0",
                    Some(DEFAULT_ALPHA_THRESHOLD),
                ));
            }
        }

        if let Some(SelectionPolicy::Salience { epsilon }) = self.selection_policy {
            if !(epsilon > 0.0 && epsilon <= 1.0) {
                return Err(CutoutError::config_value_error(
                    "salience epsilon",
                    epsilon,
                    ">0.0-1.0",
                    Some(DEFAULT_SALIENCE_EPSILON),
                ));
            }
        }

        if self.detection.max_det == 0 {
            return Err(CutoutError::config_value_error("max_det", 0, ">=1", Some(10)));
        }
        let imgsz = self.detection.imgsz;
        if imgsz == 0 || imgsz % 32 != 0 || imgsz > MAX_IMGSZ {
            return Err(CutoutError::config_value_error(
                "imgsz",
                imgsz,
                "multiple of 32 in 32-4096",
                Some(640),
            ));
        }
        if self.foreground.input_size == 0 {
            return Err(CutoutError::config_value_error(
                "foreground input size",
                0,
                ">=1",
                Some(320),
            ));
        }
        if self.auto_masks.points_per_side == 0 {
            return Err(CutoutError::config_value_error(
                "points_per_side",
                0,
                ">=1",
                Some(16),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(CutoutError::config_value_error(
                "fetch timeout",
                0,
                ">=1 seconds",
                Some(30),
            ));
        }
        if self.storage.presign_expires == 0 || self.storage.presign_expires > MAX_PRESIGN_EXPIRES {
            return Err(CutoutError::config_value_error(
                "presign_expires",
                self.storage.presign_expires,
                "1-604800 seconds",
                Some(3600),
            ));
        }

        Ok(())
    }

    /// Process-wide defaults from the environment
    ///
    /// # Errors
    /// - A variable is present but cannot be parsed
    /// - The resulting configuration fails validation
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Process-wide defaults from an arbitrary variable lookup
    ///
    /// Recognized variables: `SEGMENTER`, `BACKEND`, `EXECUTION_PROVIDER`,
    /// `MODEL_NAME`, `MODEL_DIR` (or `LAMBDA_TASK_ROOT`), `OUTPUT_BUCKET`
    /// (or `BUCKET_NAME`), `OUTPUT_PREFIX` (or `S3_PREFIX`), `PUBLIC_BASE_URL`,
    /// `RETURN_MODE`, `RETURN_PRESIGNED`, `PRESIGN_EXPIRES` (or
    /// `PRESIGNED_EXPIRES`), `CONF_THRESHOLD`, `IOU_THRESHOLD`, `MAX_DET`,
    /// `IMGSZ`, `RETINA_MASKS`, `SELECTION_POLICY`, `FETCH_TIMEOUT_SECS`.
    ///
    /// # Errors
    /// - A variable is present but cannot be parsed
    /// - The resulting configuration fails validation
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
        };
        let mut builder = Self::builder();

        if let Some(v) = first(&["SEGMENTER"]) {
            builder = builder.segmenter(v.parse()?);
        }
        if let Some(v) = first(&["BACKEND"]) {
            builder = builder.backend_type(v.parse()?);
        }
        if let Some(v) = first(&["EXECUTION_PROVIDER"]) {
            builder = builder.execution_provider(v.parse()?);
        }
        if let Some(v) = first(&["MODEL_DIR", "LAMBDA_TASK_ROOT"]) {
            builder = builder.model_dir(v);
        }
        if let Some(v) = first(&["MODEL_NAME"]) {
            builder = builder.model_name(v);
        }
        if let Some(v) = first(&["OUTPUT_BUCKET", "BUCKET_NAME", "S3_BUCKET"]) {
            builder = builder.bucket(v);
        }
        if let Some(v) = first(&["OUTPUT_PREFIX", "S3_PREFIX"]) {
            builder = builder.prefix(v);
        }
        if let Some(v) = first(&["PUBLIC_BASE_URL"]) {
            builder = builder.public_base_url(Some(v));
        }
        if let Some(v) = first(&["RETURN_MODE"]) {
            builder = builder.return_mode(v.parse().map_err(|e: CutoutError| {
                CutoutError::invalid_config(e.to_string())
            })?);
        } else if let Some(v) = first(&["RETURN_PRESIGNED"]) {
            builder = builder.return_mode(if parse_flag("RETURN_PRESIGNED", &v)? {
                ReturnMode::Presigned
            } else {
                ReturnMode::PublicUrl
            });
        }
        if let Some(v) = first(&["PRESIGN_EXPIRES", "PRESIGNED_EXPIRES"]) {
            builder = builder.presign_expires(parse_number("PRESIGN_EXPIRES", &v)?);
        }
        if let Some(v) = first(&["CONF_THRESHOLD"]) {
            builder = builder.conf(parse_number("CONF_THRESHOLD", &v)?);
        }
        if let Some(v) = first(&["IOU_THRESHOLD"]) {
            builder = builder.iou(parse_number("IOU_THRESHOLD", &v)?);
        }
        if let Some(v) = first(&["MAX_DET"]) {
            builder = builder.max_det(parse_number("MAX_DET", &v)?);
        }
        if let Some(v) = first(&["IMGSZ"]) {
            builder = builder.imgsz(parse_number("IMGSZ", &v)?);
        }
        if let Some(v) = first(&["RETINA_MASKS"]) {
            builder = builder.retina_masks(parse_flag("RETINA_MASKS", &v)?);
        }
        if let Some(v) = first(&["SELECTION_POLICY"]) {
            builder = builder.selection_policy(v.parse()?);
        }
        if let Some(v) = first(&["FETCH_TIMEOUT_SECS"]) {
            builder = builder.fetch_timeout_secs(parse_number("FETCH_TIMEOUT_SECS", &v)?);
        }

        builder.build()
    }

    /// Merge per-invocation tuning over these defaults
    ///
    /// Overrides are client supplied, so invalid values surface as input errors.
    ///
    /// # Errors
    /// - An override leaves the configuration invalid
    pub fn with_overrides(&self, overrides: &TuningOverrides) -> Result<Self> {
        let mut config = self.clone();

        if let Some(conf) = overrides.conf {
            config.detection.conf = conf;
        }
        if let Some(iou) = overrides.iou {
            config.detection.iou = iou;
        }
        if let Some(max_det) = overrides.max_det {
            config.detection.max_det = max_det;
        }
        if let Some(imgsz) = overrides.imgsz {
            config.detection.imgsz = imgsz;
        }
        if let Some(retina) = overrides.retina_masks {
            config.detection.retina_masks = retina;
        }
        if let Some(point) = overrides.point {
            config.prompt.point = Some(point);
        }
        if let Some(policy) = overrides.policy {
            config.selection_policy = Some(policy);
        }
        if let Some(scope) = overrides.scope {
            config.scope = scope;
        }
        if let Some(mode) = overrides.return_mode {
            config.storage.return_mode = mode;
        }
        if let Some(expires) = overrides.presign_expires {
            config.storage.presign_expires = expires;
        }

        config
            .validate()
            .map_err(|e| CutoutError::input(e.to_string()))?;
        Ok(config)
    }
}

/// Optional per-invocation tuning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningOverrides {
    pub conf: Option<f32>,
    pub iou: Option<f32>,
    pub max_det: Option<usize>,
    pub imgsz: Option<u32>,
    pub retina_masks: Option<bool>,
    pub point: Option<(f32, f32)>,
    pub policy: Option<SelectionPolicy>,
    pub scope: Option<CutoutScope>,
    pub return_mode: Option<ReturnMode>,
    pub presign_expires: Option<u64>,
}

impl TuningOverrides {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CutoutError::invalid_config(format!("{name} must be a number, got '{value}'"))
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CutoutError::invalid_config(format!(
            "{name} must be a boolean flag, got '{value}'"
        ))),
    }
}

/// Builder for `PipelineConfig`
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn segmenter(mut self, kind: SegmenterKind) -> Self {
        self.config.segmenter = kind;
        self
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.config.backend_type = backend_type;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    /// Set both intra and inter threads (inter = threads/2, minimum 1; 0 = auto)
    #[must_use]
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self.config.inter_threads = if threads > 0 { (threads / 2).max(1) } else { 0 };
        self
    }

    #[must_use]
    pub fn model_spec(mut self, model_spec: ModelSpec) -> Self {
        self.config.model_spec = Some(model_spec);
        self
    }

    /// Use a model file by name, resolved against the model directory
    #[must_use]
    pub fn model_name<S: Into<String>>(mut self, name: S) -> Self {
        let mut spec = self
            .config
            .model_spec
            .take()
            .unwrap_or_else(|| ModelSpec::default_for(self.config.segmenter));
        spec.source = crate::models::ModelSource::parse(&name.into());
        self.config.model_spec = Some(spec);
        self
    }

    #[must_use]
    pub fn model_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.model_dir = dir.into();
        self
    }

    #[must_use]
    pub fn selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.config.selection_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: CutoutScope) -> Self {
        self.config.scope = scope;
        self
    }

    #[must_use]
    pub fn no_detection(mut self, policy: NoDetectionPolicy) -> Self {
        self.config.no_detection = policy;
        self
    }

    #[must_use]
    pub fn resample_filter(mut self, filter: ResampleFilter) -> Self {
        self.config.resample_filter = filter;
        self
    }

    #[must_use]
    pub fn alpha_mode(mut self, mode: AlphaMode) -> Self {
        self.config.alpha_mode = mode;
        self
    }

    #[must_use]
    pub fn conf(mut self, conf: f32) -> Self {
        self.config.detection.conf = conf;
        self
    }

    #[must_use]
    pub fn iou(mut self, iou: f32) -> Self {
        self.config.detection.iou = iou;
        self
    }

    #[must_use]
    pub fn max_det(mut self, max_det: usize) -> Self {
        self.config.detection.max_det = max_det;
        self
    }

    #[must_use]
    pub fn imgsz(mut self, imgsz: u32) -> Self {
        self.config.detection.imgsz = imgsz;
        self
    }

    #[must_use]
    pub fn retina_masks(mut self, retina: bool) -> Self {
        self.config.detection.retina_masks = retina;
        self
    }

    #[must_use]
    pub fn foreground(mut self, params: ForegroundParams) -> Self {
        self.config.foreground = params;
        self
    }

    #[must_use]
    pub fn prompt_point(mut self, point: Option<(f32, f32)>) -> Self {
        self.config.prompt.point = point;
        self
    }

    #[must_use]
    pub fn auto_masks(mut self, params: AutoMaskParams) -> Self {
        self.config.auto_masks = params;
        self
    }

    #[must_use]
    pub fn bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.config.storage.bucket = Some(bucket.into());
        self
    }

    #[must_use]
    pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.storage.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn public_base_url(mut self, url: Option<String>) -> Self {
        self.config.storage.public_base_url = url;
        self
    }

    #[must_use]
    pub fn return_mode(mut self, mode: ReturnMode) -> Self {
        self.config.storage.return_mode = mode;
        self
    }

    #[must_use]
    pub fn presign_expires(mut self, seconds: u64) -> Self {
        self.config.storage.presign_expires = seconds;
        self
    }

    #[must_use]
    pub fn fetch_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.fetch_timeout_secs = seconds;
        self
    }

    #[must_use]
    pub fn max_image_bytes(mut self, bytes: usize) -> Self {
        self.config.max_image_bytes = bytes;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// - Any parameter outside its valid range
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
