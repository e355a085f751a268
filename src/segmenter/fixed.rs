use super::{MaskSignal, Segmenter};
use crate::config::{PipelineConfig, SegmenterKind};
use crate::error::Result;
use crate::types::{Mask, SourceImage};
use async_trait::async_trait;

/// Segmenter returning the same preset masks for every image
///
/// Used for dry runs and pass-through deployments, and to drive the rest of
/// the pipeline without model weights.
#[derive(Debug, Clone)]
pub struct FixedSegmenter {
    masks: Vec<Mask>,
    kind: SegmenterKind,
    signal: MaskSignal,
}

impl FixedSegmenter {
    #[must_use]
    pub fn new(masks: Vec<Mask>) -> Self {
        Self {
            masks,
            kind: SegmenterKind::Detection,
            signal: MaskSignal::AreaAndConfidence,
        }
    }

    /// Segmenter that never finds anything
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Report a different kind and signal, e.g. to mimic the automatic variant
    #[must_use]
    pub fn with_kind(mut self, kind: SegmenterKind, signal: MaskSignal) -> Self {
        self.kind = kind;
        self.signal = signal;
        self
    }
}

#[async_trait]
impl Segmenter for FixedSegmenter {
    async fn segment(&self, _image: &SourceImage, _config: &PipelineConfig) -> Result<Vec<Mask>> {
        Ok(self.masks.clone())
    }

    fn kind(&self) -> SegmenterKind {
        self.kind
    }

    fn natural_signal(&self) -> MaskSignal {
        self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[tokio::test]
    async fn test_returns_preset_masks() {
        let mask = Mask::rect(4, 4, 1, 1, 3, 3).with_area(4.0);
        let segmenter = FixedSegmenter::new(vec![mask.clone()])
            .with_kind(SegmenterKind::Automatic, MaskSignal::Area);
        let image = SourceImage::from_rgb(RgbImage::new(4, 4));
        let config = PipelineConfig::default();

        let masks = segmenter.segment(&image, &config).await.unwrap();
        assert_eq!(masks, vec![mask]);
        assert_eq!(segmenter.kind(), SegmenterKind::Automatic);
        assert!(segmenter.warm_up().await.unwrap().is_none());
        assert!(FixedSegmenter::empty()
            .segment(&image, &config)
            .await
            .unwrap()
            .is_empty());
    }
}
