#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # museum-cutout
//!
//! Turns a photograph into a transparent PNG "cutout" of its main subject and
//! stores it in object storage.
//!
//! One invocation runs five stages:
//!
//! 1. **Input resolution**: an HTTP(S) URL, a stored object or inline bytes is
//!    fetched and decoded to RGB.
//! 2. **Segmentation**: one of four [`Segmenter`]s proposes candidate masks
//!    (salient-object, point-prompted, automatic grid proposal, or
//!    detection with instance masks), running ONNX graphs through ONNX Runtime
//!    or Tract.
//! 3. **Selection**: candidates are ranked by a [`SelectionPolicy`].
//! 4. **Compositing**: the winning mask becomes the alpha channel at the
//!    source's resolution.
//! 5. **Delivery**: the PNG is written to a [`BlobStore`] and returned as a
//!    presigned URL, `s3://` URI, public URL, or inline bytes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use museum_cutout::{
//!     CutoutPipeline, CutoutRequest, ImageSource, MemoryStore, PipelineConfig, ReturnMode,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::builder()
//!     .bucket("scrapbook-media")
//!     .return_mode(ReturnMode::S3Uri)
//!     .build()?;
//! let pipeline = CutoutPipeline::from_config(config, Some(Arc::new(MemoryStore::new())))?;
//!
//! let request = CutoutRequest::new(ImageSource::from_reference(
//!     "https://example.com/photos/vase.jpg",
//! )?);
//! let outcome = pipeline.run(&request).await?;
//! for reference in outcome.references() {
//!     println!("{:?}", reference.url());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Invocation events
//!
//! Function-style deployments hand raw events to [`invocation::handle`],
//! which accepts direct JSON payloads, proxy events with JSON or binary bodies,
//! and returns an HTTP-style [`InvocationResponse`].
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with GPU acceleration support
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): the `museum-cutout` binary and its tracing setup
//! - `webp-support` (default): WebP input
//! - `tracing-json`, `tracing-files`: extra log sinks for the binary

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod composite;
pub mod config;
pub mod error;
pub mod inference;
pub mod input;
pub mod invocation;
pub mod models;
pub mod pipeline;
pub mod segmenter;
pub mod select;
pub mod sink;
pub mod store;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

pub use composite::Compositor;
pub use config::{
    AlphaMode, BackendType, CutoutScope, ExecutionProvider, NoDetectionPolicy, PipelineConfig,
    PipelineConfigBuilder, ResampleFilter, ReturnMode, SegmenterKind, SelectionPolicy,
    TuningOverrides,
};
pub use error::{CutoutError, Result};
pub use inference::{BackendFactory, BackendSettings, DefaultBackendFactory, InferenceBackend};
pub use input::{ImageSource, InputResolver};
pub use invocation::{decode_event, InvocationResponse};
pub use models::{ModelManager, ModelSource, ModelSpec};
pub use pipeline::{CutoutPipeline, CutoutRequest};
pub use segmenter::{build_segmenter, MaskSignal, Segmenter};
pub use sink::{ObjectTarget, Sink};
pub use store::{BlobStore, FsStore, MemoryStore, S3Config, S3Store};
pub use types::{
    Cutout, CutoutOutcome, Diagnostics, Mask, ObjectLocation, ProcessingTimings, Reference,
    SourceImage,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};
