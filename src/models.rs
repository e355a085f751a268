//! Model locating, downloading and caching
//!
//! Segmenters name their ONNX weights through a [`ModelSpec`]. A source is either
//! an explicit file, a file name resolved against the bundled model directory,
//! or a remote URL that is downloaded once into the user cache.

use crate::config::SegmenterKind;
use crate::error::{CutoutError, Result};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

/// Where a model file comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ModelSource {
    /// Explicit path on disk
    External(PathBuf),
    /// File name inside the model directory
    Named(String),
    /// HTTP(S) URL, downloaded into the cache on first use
    Remote(String),
}

impl ModelSource {
    /// Classify a user-supplied model reference
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            Self::Remote(reference.to_string())
        } else if reference.contains('/') || reference.contains('\\') {
            Self::External(PathBuf::from(reference))
        } else {
            Self::Named(reference.to_string())
        }
    }

    /// Get display name for the model source
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::External(path) => format!("external:{}", path.display()),
            Self::Named(name) => format!("named:{name}"),
            Self::Remote(url) => format!("remote:{url}"),
        }
    }
}

/// Model weights for one segmenter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Primary graph (the encoder for prompted/automatic segmenters)
    pub source: ModelSource,
    /// Mask decoder graph for encoder/decoder segmenters
    pub decoder: Option<ModelSource>,
}

impl ModelSpec {
    #[must_use]
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            decoder: None,
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: ModelSource) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Default weights shipped alongside a deployment
    #[must_use]
    pub fn default_for(kind: SegmenterKind) -> Self {
        match kind {
            SegmenterKind::Foreground => Self::new(ModelSource::Named("u2net.onnx".into())),
            SegmenterKind::Detection => Self::new(ModelSource::Named("yolo26n-seg.onnx".into())),
            SegmenterKind::Prompted | SegmenterKind::Automatic => {
                Self::new(ModelSource::Named("sam_vit_b.encoder.onnx".into()))
                    .with_decoder(ModelSource::Named("sam_vit_b.decoder.onnx".into()))
            },
        }
    }

    /// All sources referenced by this spec
    pub fn sources(&self) -> impl Iterator<Item = &ModelSource> {
        std::iter::once(&self.source).chain(self.decoder.as_ref())
    }
}

/// Download cache for remote model files
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a new model cache manager
    ///
    /// Uses `MUSEUM_CUTOUT_CACHE_DIR` when set, otherwise the platform cache
    /// directory (`~/.cache/museum-cutout/models/` on Linux).
    ///
    /// # Errors
    /// - Failed to determine cache directory
    /// - Failed to create cache directory
    pub fn new() -> Result<Self> {
        let cache_dir = Self::default_cache_dir()?;
        Self::with_custom_cache_dir(&cache_dir)
    }

    /// Create a cache rooted at a custom directory
    ///
    /// # Errors
    /// - Failed to create the directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        if !cache_dir.exists() {
            std::fs::create_dir_all(cache_dir).map_err(|e| {
                CutoutError::file_io_error("create cache directory", cache_dir, &e)
            })?;
        }
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var("MUSEUM_CUTOUT_CACHE_DIR") {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                CutoutError::invalid_config(
                    "Failed to determine cache directory. Set MUSEUM_CUTOUT_CACHE_DIR.",
                )
            })?
            .join("museum-cutout")
            .join("models"))
    }

    /// Cache-safe file name for a model URL
    ///
    /// # Examples
    /// ```
    /// use museum_cutout::models::ModelCache;
    ///
    /// let name = ModelCache::url_to_file_name("https://example.com/weights/yolo26n-seg.onnx");
    /// assert!(name.ends_with("-yolo26n-seg.onnx"));
    /// assert_eq!(name.len(), 16 + 1 + "yolo26n-seg.onnx".len());
    /// ```
    #[must_use]
    pub fn url_to_file_name(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        let hash = hash.get(..16).unwrap_or(&hash);

        let base = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .unwrap_or("model.onnx");
        format!("{hash}-{base}")
    }

    /// Path a URL is (or will be) cached at
    #[must_use]
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(Self::url_to_file_name(url))
    }

    #[must_use]
    pub fn is_cached(&self, url: &str) -> bool {
        self.cached_path(url).is_file()
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    fn new(show_progress: bool) -> Self {
        #[cfg(feature = "cli")]
        {
            if show_progress {
                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                     {bytes}/{total_bytes} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                return Self::Indicatif(pb);
            }
        }
        let _ = show_progress;
        Self::NoOp
    }

    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {
                let _ = len;
            },
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {
                let _ = pos;
            },
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }
}

/// Streams remote model files into the cache
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| CutoutError::model(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, cache })
    }

    /// Download a model file unless it is already cached
    ///
    /// The file is streamed into a temporary file inside the cache directory and
    /// renamed into place, so a failed download never leaves a partial model.
    ///
    /// # Errors
    /// - Network errors or non-success HTTP status
    /// - File system errors while writing the cache
    pub async fn download(&self, url: &str, show_progress: bool) -> Result<PathBuf> {
        let final_path = self.cache.cached_path(url);
        if final_path.is_file() {
            log::debug!("Model already cached: {}", final_path.display());
            return Ok(final_path);
        }

        log::info!("Downloading model from: {url}");
        let progress = ProgressIndicator::new(show_progress);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CutoutError::model(format!("Failed to download {url}: {e}")))?;
        if !response.status().is_success() {
            progress.finish_with_message("Download failed".to_string());
            return Err(CutoutError::model(format!(
                "HTTP error {} for {url}",
                response.status()
            )));
        }
        let total_size = response.content_length();
        if let Some(total) = total_size {
            progress.set_length(total);
        }

        let temp = tempfile::NamedTempFile::new_in(self.cache.cache_dir()).map_err(|e| {
            CutoutError::file_io_error("create temp file in", self.cache.cache_dir(), &e)
        })?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];
        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| CutoutError::model(format!("Failed to read download stream: {e}")))?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| CutoutError::file_io_error("write to file", &temp_path, &e))?;
            downloaded += bytes_read as u64;

            if total_size.is_some() {
                progress.set_position(downloaded);
            } else {
                let megabytes = downloaded as f64 / 1_048_576.0;
                progress.set_message(format!("Downloaded {megabytes:.1} MB"));
            }
        }
        file.flush()
            .await
            .map_err(|e| CutoutError::file_io_error("flush file", &temp_path, &e))?;
        drop(file);

        temp_path
            .persist(&final_path)
            .map_err(|e| {
                CutoutError::file_io_error("move downloaded model to", &final_path, &e.error)
            })?;

        progress.finish_with_message(format!("Downloaded {}", final_path.display()));
        log::info!("Downloaded {downloaded} bytes to {}", final_path.display());
        Ok(final_path)
    }

    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }
}

/// Resolves model sources to files on disk
#[derive(Debug, Clone)]
pub struct ModelManager {
    model_dir: PathBuf,
    cache_dir: Option<PathBuf>,
}

impl ModelManager {
    /// Manager resolving named models against `model_dir`
    #[must_use]
    pub fn new<P: Into<PathBuf>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.into(),
            cache_dir: None,
        }
    }

    /// Use a specific download cache directory instead of the platform default
    #[must_use]
    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, cache_dir: P) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn cache(&self) -> Result<ModelCache> {
        match &self.cache_dir {
            Some(dir) => ModelCache::with_custom_cache_dir(dir),
            None => ModelCache::new(),
        }
    }

    /// Local path for a model source
    ///
    /// # Errors
    /// - The file does not exist (remote sources must be downloaded first)
    pub fn resolve(&self, source: &ModelSource) -> Result<PathBuf> {
        let path = match source {
            ModelSource::External(path) => path.clone(),
            ModelSource::Named(name) => self.model_dir.join(name),
            ModelSource::Remote(url) => self.cache()?.cached_path(url),
        };

        if path.is_file() {
            Ok(path)
        } else {
            Err(CutoutError::model(format!(
                "Model file not found for {} (looked at '{}')",
                source.display_name(),
                path.display()
            )))
        }
    }

    /// Download a remote source into the cache if it is not there yet
    ///
    /// Named and external sources are left alone.
    ///
    /// # Errors
    /// - Download failures
    pub async fn fetch(&self, source: &ModelSource, show_progress: bool) -> Result<()> {
        if let ModelSource::Remote(url) = source {
            let cache = self.cache()?;
            if !cache.is_cached(url) {
                ModelDownloader::new(cache)?.download(url, show_progress).await?;
            }
        }
        Ok(())
    }

    /// Make sure every file of a spec is present locally, downloading remotes
    ///
    /// # Errors
    /// - Download failures
    /// - Local files missing
    pub async fn ensure_available(&self, spec: &ModelSpec, show_progress: bool) -> Result<()> {
        for source in spec.sources() {
            self.fetch(source, show_progress).await?;
            self.resolve(source)?;
        }
        Ok(())
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new("models")
    }
}
