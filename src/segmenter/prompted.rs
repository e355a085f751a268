use super::sam::SamModel;
use super::{MaskSignal, Segmenter};
use crate::config::{PipelineConfig, SegmenterKind};
use crate::error::{CutoutError, Result};
use crate::types::{Mask, SourceImage};
use async_trait::async_trait;
use instant::Duration;
use std::sync::Arc;
use tracing::debug;

/// Single-point prompted segmentation
///
/// The prompt defaults to the image center. Of the decoder's multimask
/// answers the one with the highest predicted IoU wins; that IoU becomes the
/// mask's confidence.
#[derive(Debug, Clone)]
pub struct PromptedSegmenter {
    sam: SamModel,
}

impl PromptedSegmenter {
    #[must_use]
    pub fn new(sam: SamModel) -> Self {
        Self { sam }
    }
}

fn prompt_point(image: &SourceImage, configured: Option<(f32, f32)>) -> Result<(f32, f32)> {
    let (width, height) = image.dimensions();
    let Some((x, y)) = configured else {
        return Ok((width as f32 / 2.0, height as f32 / 2.0));
    };
    if !(x.is_finite() && y.is_finite())
        || x < 0.0
        || y < 0.0
        || x >= width as f32
        || y >= height as f32
    {
        return Err(CutoutError::input(format!(
            "Prompt point ({x}, {y}) lies outside the {width}x{height} image"
        )));
    }
    Ok((x, y))
}

#[async_trait]
impl Segmenter for PromptedSegmenter {
    async fn segment(&self, image: &SourceImage, config: &PipelineConfig) -> Result<Vec<Mask>> {
        let point = prompt_point(image, config.prompt.point)?;
        let embedding = Arc::new(self.sam.embed(image).await?);
        let letterbox = *embedding.letterbox();

        let proposals = self
            .sam
            .decode_points(embedding, vec![point])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let best = proposals
            .iter()
            .enumerate()
            .fold(None::<(usize, f32)>, |best, (i, p)| match best {
                Some((_, score)) if score >= p.predicted_iou => best,
                _ => Some((i, p.predicted_iou)),
            })
            .and_then(|(i, _)| proposals.get(i))
            .ok_or_else(|| CutoutError::inference("Mask decoder returned no masks"))?;

        debug!(
            x = point.0,
            y = point.1,
            predicted_iou = best.predicted_iou,
            candidates = proposals.len(),
            "Selected prompted mask"
        );
        let mask = best
            .to_mask(&letterbox)?
            .with_measured_area(image.dimensions())
            .with_confidence(best.predicted_iou);
        Ok(vec![mask])
    }

    fn kind(&self) -> SegmenterKind {
        SegmenterKind::Prompted
    }

    fn natural_signal(&self) -> MaskSignal {
        MaskSignal::AreaAndConfidence
    }

    async fn warm_up(&self) -> Result<Option<Duration>> {
        self.sam.warm_up().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::sam::testing::{rect_logits, scripted_sam};
    use image::RgbImage;
    use ndarray::Array2;

    /// Three answers; the middle one has the best IoU and covers the left half
    fn three_answers(_point: (f32, f32), size: (usize, usize)) -> (Vec<Array2<f32>>, Vec<f32>) {
        let (height, width) = size;
        (
            vec![
                rect_logits(size, (0, 0, width, height), 6.0, -6.0),
                rect_logits(size, (0, 0, width / 2, height), 6.0, -6.0),
                Array2::from_elem(size, -6.0),
            ],
            vec![0.5, 0.93, 0.2],
        )
    }

    #[test]
    fn test_default_point_is_center() {
        let image = SourceImage::from_rgb(RgbImage::new(40, 20));
        assert_eq!(prompt_point(&image, None).unwrap(), (20.0, 10.0));
        assert_eq!(prompt_point(&image, Some((3.0, 4.0))).unwrap(), (3.0, 4.0));
        assert!(matches!(
            prompt_point(&image, Some((40.0, 4.0))),
            Err(CutoutError::Input(_))
        ));
        assert!(prompt_point(&image, Some((f32::NAN, 1.0))).is_err());
    }

    #[tokio::test]
    async fn test_best_of_multimask_by_predicted_iou() {
        let (sam, _dir, _decoder) = scripted_sam(three_answers);
        let segmenter = PromptedSegmenter::new(sam);
        let image = SourceImage::from_rgb(RgbImage::new(40, 20));

        let masks = segmenter
            .segment(&image, &PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].dimensions(), (40, 20));
        assert_eq!(masks[0].confidence(), Some(0.93));
        assert!((masks[0].area().unwrap() - 400.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_point_outside_image_is_input_error() {
        let (sam, _dir, decoder) = scripted_sam(three_answers);
        let segmenter = PromptedSegmenter::new(sam);
        let image = SourceImage::from_rgb(RgbImage::new(40, 20));
        let config = PipelineConfig::builder()
            .prompt_point(Some((100.0, 5.0)))
            .build()
            .unwrap();

        let result = segmenter.segment(&image, &config).await;
        assert!(matches!(result, Err(CutoutError::Input(_))));
        assert_eq!(decoder.run_count(), 0);
    }
}
