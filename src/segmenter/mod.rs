//! Segmenters: image in, candidate masks out
//!
//! Four model-backed variants share one [`Segmenter`] trait:
//!
//! - [`ForegroundSegmenter`]: salient-object model, exactly one mask with area
//! - [`PromptedSegmenter`]: SAM-style encoder/decoder seeded by one point
//! - [`AutomaticSegmenter`]: SAM decoder driven by a grid of point prompts
//! - [`DetectionSegmenter`]: YOLO-seg detector with per-instance masks
//!
//! plus [`FixedSegmenter`], which returns preset masks. Model weights load
//! lazily through [`EngineSlot`] and at most once per process.

mod automatic;
mod detection;
mod engine;
mod fixed;
mod foreground;
mod lazy;
mod prompted;
mod sam;

pub use automatic::AutomaticSegmenter;
pub use detection::DetectionSegmenter;
pub use engine::{Engine, EngineSlot, Outputs};
pub use fixed::FixedSegmenter;
pub use foreground::ForegroundSegmenter;
pub use lazy::LazyModel;
pub use prompted::PromptedSegmenter;
pub use sam::SamModel;

use crate::config::{PipelineConfig, SegmenterKind};
use crate::error::{CutoutError, Result};
use crate::inference::{BackendFactory, BackendSettings};
use crate::models::ModelManager;
use crate::types::{Mask, SourceImage};
use async_trait::async_trait;
use instant::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ranking signals a segmenter attaches to its masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskSignal {
    Area,
    Confidence,
    AreaAndConfidence,
}

impl MaskSignal {
    #[must_use]
    pub fn has_area(self) -> bool {
        matches!(self, Self::Area | Self::AreaAndConfidence)
    }

    #[must_use]
    pub fn has_confidence(self) -> bool {
        matches!(self, Self::Confidence | Self::AreaAndConfidence)
    }
}

/// Produces zero or more candidate masks for an image
#[async_trait]
pub trait Segmenter: Send + Sync + std::fmt::Debug {
    /// Candidate masks for `image` under the per-request `config`
    ///
    /// # Errors
    /// - `Inference` for model failures or unexpected output shapes
    /// - `Model` when weights cannot be loaded
    /// - `Input` for prompts outside the image
    async fn segment(&self, image: &SourceImage, config: &PipelineConfig) -> Result<Vec<Mask>>;

    fn kind(&self) -> SegmenterKind;

    fn natural_signal(&self) -> MaskSignal;

    /// Load model weights ahead of the first request
    ///
    /// Returns the load time when this call did the loading.
    ///
    /// # Errors
    /// - Load failures
    async fn warm_up(&self) -> Result<Option<Duration>> {
        Ok(None)
    }
}

/// Build the model-backed segmenter selected by `config`
///
/// Nothing is loaded here; weights load on first use or [`Segmenter::warm_up`].
///
/// # Errors
/// - Encoder/decoder segmenters configured without a decoder model
pub fn build_segmenter(
    config: &PipelineConfig,
    factory: Arc<dyn BackendFactory>,
    models: ModelManager,
) -> Result<Arc<dyn Segmenter>> {
    let spec = config.effective_model_spec();
    let settings = BackendSettings::from_config(config);
    let slot = |role: &'static str, source, settings: BackendSettings| {
        Arc::new(EngineSlot::new(
            role,
            source,
            config.backend_type,
            settings,
            Arc::clone(&factory),
            models.clone(),
        ))
    };

    let segmenter: Arc<dyn Segmenter> = match config.segmenter {
        SegmenterKind::Foreground => {
            let size = config.foreground.input_size as usize;
            Arc::new(ForegroundSegmenter::new(slot(
                "foreground",
                spec.source,
                settings.with_input_shapes(vec![vec![1, 3, size, size]]),
            )))
        },
        SegmenterKind::Detection => {
            let size = config.detection.imgsz as usize;
            Arc::new(DetectionSegmenter::new(slot(
                "detector",
                spec.source,
                settings.with_input_shapes(vec![vec![1, 3, size, size]]),
            )))
        },
        SegmenterKind::Prompted | SegmenterKind::Automatic => {
            let decoder = spec.decoder.ok_or_else(|| {
                CutoutError::invalid_config(format!(
                    "The {} segmenter needs both an encoder and a decoder model",
                    config.segmenter
                ))
            })?;
            let size = sam::ENCODER_SIZE as usize;
            let sam = SamModel::new(
                slot(
                    "encoder",
                    spec.source,
                    settings.clone().with_input_shapes(vec![vec![1, 3, size, size]]),
                ),
                slot("decoder", decoder, settings),
            );
            if config.segmenter == SegmenterKind::Prompted {
                Arc::new(PromptedSegmenter::new(sam))
            } else {
                Arc::new(AutomaticSegmenter::new(sam))
            }
        },
    };
    Ok(segmenter)
}
