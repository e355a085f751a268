//! Shared SAM-style image encoder and prompt decoder
//!
//! The encoder runs once per image on a 1024 canvas (longest side resized,
//! padded bottom-right). The decoder then answers point prompts against the
//! cached embedding. Decoder inputs are matched by name, which covers the
//! common exports (`image_embeddings`, SAM2's `image_embed` plus
//! `high_res_feats_*`, optional `orig_im_size`).

use super::{Engine, EngineSlot};
use crate::error::{CutoutError, Result};
use crate::types::{Mask, SourceImage};
use crate::utils::{sigmoid, ImagePreprocessor, Letterbox, PreprocessingConfig};
use instant::Duration;
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, Axis, Ix4};
use std::sync::Arc;
use tracing::debug;

/// Encoder input side
pub const ENCODER_SIZE: u32 = 1024;

/// Side of the decoder's low-resolution mask prompt
const MASK_INPUT_SIZE: usize = 256;

/// Encoder outputs for one image plus the transform used to produce them
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    tensors: Vec<(String, ArrayD<f32>)>,
    letterbox: Letterbox,
}

impl ImageEmbedding {
    #[must_use]
    pub fn letterbox(&self) -> &Letterbox {
        &self.letterbox
    }

    /// Encoder output feeding the decoder input `name`
    fn tensor_for(&self, name: &str) -> Option<&ArrayD<f32>> {
        if let Some((_, tensor)) = self.tensors.iter().find(|(n, _)| n == name) {
            return Some(tensor);
        }
        match name {
            "image_embeddings" | "image_embed" => self.tensors.first().map(|(_, t)| t),
            _ => None,
        }
    }
}

/// One decoder answer: mask logits and the predicted IoU
#[derive(Debug, Clone)]
pub struct Proposal {
    pub logits: Array2<f32>,
    pub predicted_iou: f32,
}

impl Proposal {
    /// Area above `+offset` over area above `-offset`; 0 when both are empty
    #[must_use]
    pub fn stability_score(&self, offset: f32) -> f32 {
        let high = self.logits.iter().filter(|&&v| v > offset).count();
        let low = self.logits.iter().filter(|&&v| v > -offset).count();
        if low == 0 {
            0.0
        } else {
            high as f32 / low as f32
        }
    }

    /// Membership mask in source space
    ///
    /// Logits already at image size are used directly; anything else is taken
    /// to cover the padded encoder canvas and cropped to the image content.
    ///
    /// # Errors
    /// - Empty logits
    pub fn to_mask(&self, letterbox: &Letterbox) -> Result<Mask> {
        let probabilities = self.logits.mapv(sigmoid);
        let (height, width) = probabilities.dim();
        if (width as u32, height as u32) == (letterbox.source_width, letterbox.source_height) {
            Mask::new(width as u32, height as u32, probabilities.iter().copied().collect())
        } else {
            letterbox.crop_plane(&probabilities.view())
        }
    }
}

/// Encoder plus decoder, each loaded on first use
#[derive(Debug, Clone)]
pub struct SamModel {
    encoder: Arc<EngineSlot>,
    decoder: Arc<EngineSlot>,
}

impl SamModel {
    #[must_use]
    pub fn new(encoder: Arc<EngineSlot>, decoder: Arc<EngineSlot>) -> Self {
        Self { encoder, decoder }
    }

    /// Load both graphs; the summed load time when this call loaded anything
    ///
    /// # Errors
    /// - Load failures
    pub async fn warm_up(&self) -> Result<Option<Duration>> {
        let encoder = self.encoder.warm_up().await?;
        let decoder = self.decoder.warm_up().await?;
        Ok(match (encoder, decoder) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or_default() + b.unwrap_or_default()),
        })
    }

    /// Run the image encoder
    ///
    /// # Errors
    /// - Encoder failures or no outputs
    pub async fn embed(&self, image: &SourceImage) -> Result<ImageEmbedding> {
        let (tensor, letterbox) =
            ImagePreprocessor::preprocess(image.rgb(), &PreprocessingConfig::sam(ENCODER_SIZE))?;
        let (names, tensors) = self.encoder.run(vec![tensor.into_dyn()]).await?.into_parts();
        if tensors.is_empty() {
            return Err(CutoutError::inference("Image encoder produced no outputs"));
        }

        let tensors = tensors
            .into_iter()
            .enumerate()
            .map(|(i, tensor)| {
                let name = names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("encoder_output_{i}"));
                (name, tensor)
            })
            .collect();
        Ok(ImageEmbedding { tensors, letterbox })
    }

    /// Decode every point prompt (source pixels) in one blocking task
    ///
    /// # Errors
    /// - Decoder inputs that cannot be satisfied
    /// - Decoder failures or malformed outputs
    pub async fn decode_points(
        &self,
        embedding: Arc<ImageEmbedding>,
        points: Vec<(f32, f32)>,
    ) -> Result<Vec<Vec<Proposal>>> {
        self.decoder
            .with_engine(move |engine| {
                points
                    .iter()
                    .map(|&point| decode_point(engine, &embedding, point))
                    .collect()
            })
            .await
    }
}

fn decoder_inputs(
    names: &[String],
    embedding: &ImageEmbedding,
    point: (f32, f32),
) -> Result<Vec<ArrayD<f32>>> {
    if names.is_empty() {
        return Err(CutoutError::inference("Mask decoder declares no inputs"));
    }
    let letterbox = &embedding.letterbox;
    let (mx, my) = letterbox.to_model(point.0, point.1);

    names
        .iter()
        .map(|name| {
            let tensor = match name.as_str() {
                // prompt point, then a padding point labelled -1
                "point_coords" => Array3::from_shape_vec((1, 2, 2), vec![mx, my, 0.0, 0.0])
                    .map(|a| a.into_dyn())
                    .map_err(|e| CutoutError::internal(e.to_string()))?,
                "point_labels" => Array2::from_shape_vec((1, 2), vec![1.0, -1.0])
                    .map(|a| a.into_dyn())
                    .map_err(|e| CutoutError::internal(e.to_string()))?,
                "mask_input" => {
                    Array4::<f32>::zeros((1, 1, MASK_INPUT_SIZE, MASK_INPUT_SIZE)).into_dyn()
                },
                "has_mask_input" => Array1::<f32>::zeros(1).into_dyn(),
                "orig_im_size" => Array1::from(vec![
                    letterbox.source_height as f32,
                    letterbox.source_width as f32,
                ])
                .into_dyn(),
                other => embedding.tensor_for(other).cloned().ok_or_else(|| {
                    CutoutError::inference(format!("Unsupported mask decoder input '{other}'"))
                })?,
            };
            Ok(tensor)
        })
        .collect()
}

fn decode_point(
    engine: &Engine,
    embedding: &ImageEmbedding,
    point: (f32, f32),
) -> Result<Vec<Proposal>> {
    let inputs = decoder_inputs(engine.input_names(), embedding, point)?;
    let outputs = engine.run(inputs)?;

    let masks = outputs
        .get(&["masks"], 0)?
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| CutoutError::inference(format!("Decoder masks must be 4-D: {e}")))?;
    let ious: Vec<f32> = outputs
        .get(&["iou_predictions", "iou_prediction", "scores"], 1)?
        .iter()
        .copied()
        .collect();

    let masks = masks.index_axis_move(Axis(0), 0);
    let proposals: Vec<Proposal> = masks
        .outer_iter()
        .enumerate()
        .map(|(i, logits)| Proposal {
            logits: logits.to_owned(),
            predicted_iou: ious.get(i).copied().unwrap_or(0.0),
        })
        .collect();
    debug!(
        x = point.0,
        y = point.1,
        proposals = proposals.len(),
        "Decoded point prompt"
    );
    Ok(proposals)
}
