//! YOLO-seg detection with per-instance masks
//!
//! Two output layouts are understood, told apart by the shape of the
//! prediction tensor given `nm` prototype channels:
//!
//! - end-to-end `[1, N, 6 + nm]` rows of `x1, y1, x2, y2, score, class, coeffs…`,
//!   already suppressed by the graph
//! - raw `[1, 4 + nc + nm, anchors]` columns of `cx, cy, w, h, class scores…, coeffs…`,
//!   followed here by class-aware non-maximum suppression
//!
//! A shape that fits both (`6 + nm` columns and more than `4 + nm` rows) is
//! read as raw only when anchors outnumber channels.

use super::{EngineSlot, MaskSignal, Segmenter};
use crate::config::{DetectionParams, PipelineConfig, ResampleFilter, SegmenterKind};
use crate::error::{CutoutError, Result};
use crate::types::{Mask, SourceImage};
use crate::utils::{sigmoid, ImagePreprocessor, Letterbox, PreprocessingConfig};
use async_trait::async_trait;
use instant::Duration;
use ndarray::{Array2, ArrayD, ArrayView2, ArrayView3, Axis, Ix3, Ix4};
use std::sync::Arc;
use tracing::debug;

/// Detector plus mask prototypes, e.g. YOLO26-seg
#[derive(Debug)]
pub struct DetectionSegmenter {
    slot: Arc<EngineSlot>,
}

impl DetectionSegmenter {
    #[must_use]
    pub fn new(slot: Arc<EngineSlot>) -> Self {
        Self { slot }
    }
}

/// One surviving detection in model-canvas coordinates
#[derive(Debug, Clone, PartialEq)]
struct Detection {
    /// `x1, y1, x2, y2`
    bbox: [f32; 4],
    score: f32,
    class: usize,
    coeffs: Vec<f32>,
}

fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = iw * ih;
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Prediction tensor arrangement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    EndToEnd,
    Raw,
}

/// Pick the layout of a `[rows, cols]` prediction plane
fn detect_layout(rows: usize, cols: usize, nm: usize) -> Result<Layout> {
    let end_to_end = cols == 6 + nm;
    // raw needs at least one class channel
    let raw = rows > 4 + nm;
    match (end_to_end, raw) {
        (true, true) if cols > rows => Ok(Layout::Raw),
        (true, _) => Ok(Layout::EndToEnd),
        (false, true) => Ok(Layout::Raw),
        (false, false) => Err(CutoutError::inference(format!(
            "Unrecognized prediction shape [{rows}, {cols}] for {nm} mask coefficients"
        ))),
    }
}

fn sort_by_score(detections: &mut [Detection]) {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn end_to_end_candidates(rows: &ArrayView2<'_, f32>, nm: usize, conf: f32) -> Vec<Detection> {
    rows.outer_iter()
        .filter(|row| row[4] > conf)
        .map(|row| Detection {
            bbox: [row[0], row[1], row[2], row[3]],
            score: row[4],
            class: row[5].max(0.0) as usize,
            coeffs: row.iter().skip(6).take(nm).copied().collect(),
        })
        .collect()
}

fn raw_candidates(
    channels: &ArrayView2<'_, f32>,
    nm: usize,
    conf: f32,
) -> Result<Vec<Detection>> {
    let rows = channels.nrows();
    if rows <= 4 + nm {
        return Err(CutoutError::inference(format!(
            "Prediction has {rows} channels, too few for 4 box + classes + {nm} mask coefficients"
        )));
    }
    let nc = rows - 4 - nm;

    let mut detections = Vec::new();
    for column in channels.axis_iter(Axis(1)) {
        let (class, score) = column
            .iter()
            .skip(4)
            .take(nc)
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, s)| {
                if s > best.1 {
                    (i, s)
                } else {
                    best
                }
            });
        if score <= conf {
            continue;
        }
        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        detections.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class,
            coeffs: column.iter().skip(4 + nc).copied().collect(),
        });
    }
    Ok(detections)
}

/// Greedy per-class suppression, highest score first
fn non_max_suppression(mut detections: Vec<Detection>, iou: f32) -> Vec<Detection> {
    sort_by_score(&mut detections);
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class == candidate.class && box_iou(&k.bbox, &candidate.bbox) > iou);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Zero everything outside the box (scaled by `sx`, `sy`) and binarize at 0.5
fn crop_and_binarize(mut plane: Array2<f32>, bbox: &[f32; 4], sx: f32, sy: f32) -> Array2<f32> {
    let (x1, y1, x2, y2) = (bbox[0] * sx, bbox[1] * sy, bbox[2] * sx, bbox[3] * sy);
    for ((y, x), value) in plane.indexed_iter_mut() {
        let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
        let inside = cx >= x1 && cx < x2 && cy >= y1 && cy < y2;
        *value = if inside && *value > 0.5 { 1.0 } else { 0.0 };
    }
    plane
}

fn render_mask(
    detection: &Detection,
    protos: &ArrayView3<'_, f32>,
    letterbox: &Letterbox,
    retina: bool,
) -> Result<Mask> {
    let (nm, proto_height, proto_width) = protos.dim();
    let mut plane = Array2::<f32>::zeros((proto_height, proto_width));
    for (k, &coeff) in detection.coeffs.iter().enumerate().take(nm) {
        plane.scaled_add(coeff, &protos.index_axis(Axis(0), k));
    }
    plane.mapv_inplace(sigmoid);

    let size = letterbox.target_size;
    if retina {
        let soft = Mask::from_fn(proto_width as u32, proto_height as u32, |x, y| {
            plane[[y as usize, x as usize]]
        })
        .resize(size, size, ResampleFilter::Bilinear);
        let upsampled = Array2::from_shape_vec((size as usize, size as usize), soft.data().to_vec())
            .map_err(|e| CutoutError::inference(format!("Invalid upsampled mask: {e}")))?;
        let binary = crop_and_binarize(upsampled, &detection.bbox, 1.0, 1.0);
        Ok(letterbox.plane_to_source(&binary.view()))
    } else {
        let sx = proto_width as f32 / size as f32;
        let sy = proto_height as f32 / size as f32;
        let binary = crop_and_binarize(plane, &detection.bbox, sx, sy);
        letterbox.crop_plane(&binary.view())
    }
}

/// Turn raw detector outputs into source-space masks with area and confidence
pub(crate) fn decode_output(
    predictions: &ArrayD<f32>,
    protos: &ArrayD<f32>,
    letterbox: &Letterbox,
    params: &DetectionParams,
) -> Result<Vec<Mask>> {
    let protos = protos
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| CutoutError::inference(format!("Mask prototypes must be 4-D: {e}")))?;
    let predictions = predictions
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| CutoutError::inference(format!("Predictions must be 3-D: {e}")))?;
    if protos.len_of(Axis(0)) == 0 || predictions.len_of(Axis(0)) == 0 {
        return Err(CutoutError::inference("Detector produced an empty batch"));
    }
    let protos = protos.index_axis_move(Axis(0), 0);
    let nm = protos.dim().0;
    let predictions = predictions.index_axis_move(Axis(0), 0);

    let layout = detect_layout(predictions.nrows(), predictions.ncols(), nm)?;
    let mut detections = match layout {
        Layout::EndToEnd => {
            let mut rows = end_to_end_candidates(&predictions, nm, params.conf);
            sort_by_score(&mut rows);
            rows
        },
        Layout::Raw => {
            non_max_suppression(raw_candidates(&predictions, nm, params.conf)?, params.iou)
        },
    };
    detections.truncate(params.max_det);
    debug!(count = detections.len(), nm, ?layout, "Detections after filtering");

    let source = (letterbox.source_width, letterbox.source_height);
    detections
        .iter()
        .map(|detection| {
            render_mask(detection, &protos, letterbox, params.retina_masks).map(|mask| {
                mask.with_measured_area(source)
                    .with_confidence(detection.score)
            })
        })
        .collect()
}

#[async_trait]
impl Segmenter for DetectionSegmenter {
    async fn segment(&self, image: &SourceImage, config: &PipelineConfig) -> Result<Vec<Mask>> {
        let params = &config.detection;
        let (tensor, letterbox) =
            ImagePreprocessor::preprocess(image.rgb(), &PreprocessingConfig::yolo(params.imgsz))?;

        let outputs = self.slot.run(vec![tensor.into_dyn()]).await?;
        let predictions = outputs
            .by_rank(3)
            .ok_or_else(|| CutoutError::inference("Detector produced no 3-D prediction tensor"))?;
        let protos = outputs
            .by_rank(4)
            .ok_or_else(|| CutoutError::inference("Detector produced no mask prototypes"))?;

        decode_output(predictions, protos, &letterbox, params)
    }

    fn kind(&self) -> SegmenterKind {
        SegmenterKind::Detection
    }

    fn natural_signal(&self) -> MaskSignal {
        MaskSignal::AreaAndConfidence
    }

    async fn warm_up(&self) -> Result<Option<Duration>> {
        self.slot.warm_up().await
    }
}
