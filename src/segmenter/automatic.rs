use super::sam::{Proposal, SamModel};
use super::{MaskSignal, Segmenter};
use crate::config::{AutoMaskParams, PipelineConfig, SegmenterKind};
use crate::error::Result;
use crate::types::{Mask, SourceImage};
use crate::utils::Letterbox;
use async_trait::async_trait;
use instant::Duration;
use std::sync::Arc;
use tracing::debug;

/// Automatic mask proposal over a regular grid of point prompts
///
/// Every decoder answer is a candidate. Candidates are filtered by predicted
/// IoU and stability, deduplicated by mask IoU (the higher predicted IoU
/// survives) and small regions are dropped. Masks carry area only.
#[derive(Debug, Clone)]
pub struct AutomaticSegmenter {
    sam: SamModel,
}

impl AutomaticSegmenter {
    #[must_use]
    pub fn new(sam: SamModel) -> Self {
        Self { sam }
    }
}

/// Cell centers of an `n x n` grid over the image
fn grid_points(width: u32, height: u32, points_per_side: u32) -> Vec<(f32, f32)> {
    let n = points_per_side.max(1);
    let step_x = width as f32 / n as f32;
    let step_y = height as f32 / n as f32;
    (0..n)
        .flat_map(|j| (0..n).map(move |i| ((i as f32 + 0.5) * step_x, (j as f32 + 0.5) * step_y)))
        .collect()
}

fn filter_proposals(
    proposals: Vec<Proposal>,
    letterbox: &Letterbox,
    params: &AutoMaskParams,
) -> Result<Vec<Mask>> {
    let total = proposals.len();
    let mut scored: Vec<(f32, Mask)> = Vec::new();
    for proposal in proposals {
        if proposal.predicted_iou < params.pred_iou_thresh
            || proposal.stability_score(params.stability_score_offset)
                < params.stability_score_thresh
        {
            continue;
        }
        let mask = proposal
            .to_mask(letterbox)?
            .with_measured_area((letterbox.source_width, letterbox.source_height));
        if mask.area().unwrap_or(0.0) < params.min_area {
            continue;
        }
        scored.push((proposal.predicted_iou, mask));
    }
    let passed = scored.len();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut kept: Vec<Mask> = Vec::with_capacity(scored.len());
    for (_, mask) in scored {
        if kept.iter().all(|k| k.iou(&mask) <= params.dedup_iou_thresh) {
            kept.push(mask);
        }
    }

    debug!(
        proposals = total,
        passed_filters = passed,
        kept = kept.len(),
        "Automatic mask proposals"
    );
    Ok(kept)
}

#[async_trait]
impl Segmenter for AutomaticSegmenter {
    async fn segment(&self, image: &SourceImage, config: &PipelineConfig) -> Result<Vec<Mask>> {
        let params = &config.auto_masks;
        let embedding = Arc::new(self.sam.embed(image).await?);
        let letterbox = *embedding.letterbox();

        let points = grid_points(image.width(), image.height(), params.points_per_side);
        let proposals = self
            .sam
            .decode_points(embedding, points)
            .await?
            .into_iter()
            .flatten()
            .collect();

        filter_proposals(proposals, &letterbox, params)
    }

    fn kind(&self) -> SegmenterKind {
        SegmenterKind::Automatic
    }

    fn natural_signal(&self) -> MaskSignal {
        MaskSignal::Area
    }

    async fn warm_up(&self) -> Result<Option<Duration>> {
        self.sam.warm_up().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::sam::testing::{rect_logits, scripted_sam};
    use crate::segmenter::sam::ENCODER_SIZE;
    use crate::utils::PadAnchor;
    use image::RgbImage;
    use ndarray::Array2;

    fn proposal(logits: Array2<f32>, predicted_iou: f32) -> Proposal {
        Proposal {
            logits,
            predicted_iou,
        }
    }

    fn params() -> AutoMaskParams {
        AutoMaskParams {
            min_area: 10.0,
            ..AutoMaskParams::default()
        }
    }

    #[test]
    fn test_grid_points_are_cell_centers() {
        let points = grid_points(40, 20, 2);
        assert_eq!(
            points,
            vec![(10.0, 5.0), (30.0, 5.0), (10.0, 15.0), (30.0, 15.0)]
        );
        assert_eq!(grid_points(100, 100, 16).len(), 256);
    }

    #[test]
    fn test_filters_and_deduplicates() {
        let size = (20, 40);
        let letterbox = Letterbox::new((40, 20), ENCODER_SIZE, PadAnchor::TopLeft);
        let left = rect_logits(size, (0, 0, 20, 20), 8.0, -8.0);
        let right = rect_logits(size, (24, 0, 40, 20), 8.0, -8.0);
        let tiny = rect_logits(size, (0, 0, 2, 2), 8.0, -8.0);
        // +0.5 inside: passes -1 but not +1, so stability is 0
        let unstable = rect_logits(size, (0, 0, 40, 20), 0.5, -8.0);

        let proposals = vec![
            proposal(left.clone(), 0.90),
            proposal(left, 0.95),
            proposal(right, 0.89),
            proposal(tiny, 0.99),
            proposal(unstable, 0.99),
            proposal(rect_logits(size, (0, 0, 40, 20), 8.0, -8.0), 0.5),
        ];

        let masks = filter_proposals(proposals, &letterbox, &params()).unwrap();
        let areas: Vec<_> = masks.iter().filter_map(Mask::area).collect();
        assert_eq!(areas, vec![400.0, 320.0]);
        assert!(masks.iter().all(|m| m.confidence().is_none()));
    }

    #[tokio::test]
    async fn test_segment_prompts_every_grid_point() {
        fn quadrant(point: (f32, f32), size: (usize, usize)) -> (Vec<Array2<f32>>, Vec<f32>) {
            // The prompt is in encoder space; 40x20 scales by 25.6
            let (height, width) = size;
            let x = (point.0 / 25.6) as usize;
            let region = if x < width / 2 {
                (0, 0, width / 2, height)
            } else {
                (width / 2, 0, width, height)
            };
            (vec![rect_logits(size, region, 8.0, -8.0)], vec![0.95])
        }
        let (sam, _dir, decoder) = scripted_sam(quadrant);
        let segmenter = AutomaticSegmenter::new(sam);
        let config = PipelineConfig::builder()
            .auto_masks(AutoMaskParams {
                points_per_side: 2,
                ..params()
            })
            .build()
            .unwrap();
        let image = SourceImage::from_rgb(RgbImage::new(40, 20));

        let masks = segmenter.segment(&image, &config).await.unwrap();
        assert_eq!(decoder.run_count(), 4);
        assert_eq!(masks.len(), 2);
        assert!(masks.iter().all(|m| m.area() == Some(400.0)));
    }
}
