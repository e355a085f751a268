//! Error types for cutout pipeline operations

use thiserror::Error;

/// Result type alias for cutout pipeline operations
pub type Result<T> = std::result::Result<T, CutoutError>;

/// Error taxonomy for one pipeline invocation
///
/// Every variant maps onto a machine-readable [`kind`](CutoutError::kind) and an
/// HTTP-style [`status_code`](CutoutError::status_code) so the invocation boundary
/// can turn any failure into a structured response.
#[derive(Error, Debug)]
pub enum CutoutError {
    /// Missing or malformed request field
    #[error("Invalid input: {0}")]
    Input(String),

    /// Remote image unreachable or answered with a non-success status
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Bytes are not a decodable image
    #[error("Decode error: {0}")]
    Decode(String),

    /// The segmentation backend failed internally
    #[error("Inference error: {0}")]
    Inference(String),

    /// Blob store write, read or URL generation failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Model loading or locating errors
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid process-wide configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding errors raised after decode
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CutoutError {
    /// Create a new input error
    pub fn input<S: Into<String>>(msg: S) -> Self {
        Self::Input(msg.into())
    }

    /// Create a new fetch error
    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Create storage error with bucket/key context
    pub fn storage_with_object(operation: &str, bucket: &str, key: &str, detail: &str) -> Self {
        Self::Storage(format!(
            "Failed to {} 's3://{}/{}': {}",
            operation, bucket, key, detail
        ))
    }

    /// Machine-readable error kind used in response bodies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "invalid_input",
            Self::Fetch(_) => "failed_to_fetch_image",
            Self::Decode(_) => "decode_failed",
            Self::Inference(_) => "inference_failed",
            Self::Storage(_) => "storage_failed",
            Self::Model(_) => "model_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) | Self::Image(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP-style status category
    ///
    /// Client-caused failures map to 400, an unreachable source image to 502 and
    /// everything the server owns to 500.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Input(_) | Self::Decode(_) => 400,
            Self::Fetch(_) => 502,
            Self::Inference(_)
            | Self::Storage(_)
            | Self::Model(_)
            | Self::InvalidConfig(_)
            | Self::Io(_)
            | Self::Image(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether changing the request could fix this failure
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}
