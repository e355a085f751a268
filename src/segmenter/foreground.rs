use super::{EngineSlot, MaskSignal, Segmenter};
use crate::config::{ForegroundParams, PipelineConfig, SegmenterKind};
use crate::error::{CutoutError, Result};
use crate::types::{Mask, SourceImage};
use crate::utils::{ImagePreprocessor, Letterbox, PreprocessingConfig};
use async_trait::async_trait;
use instant::Duration;
use ndarray::{Array2, ArrayD};
use std::sync::Arc;
use tracing::debug;

/// Salient-object segmenter (U2-Net / ISNet family)
///
/// Always yields exactly one mask, the model's foreground prediction mapped
/// back onto the image content.
#[derive(Debug)]
pub struct ForegroundSegmenter {
    slot: Arc<EngineSlot>,
}

impl ForegroundSegmenter {
    #[must_use]
    pub fn new(slot: Arc<EngineSlot>) -> Self {
        Self { slot }
    }
}

/// Last two axes of the first output as a 2-D plane
fn prediction_plane(output: &ArrayD<f32>) -> Result<Array2<f32>> {
    let shape = output.shape();
    if shape.len() < 2 {
        return Err(CutoutError::inference(format!(
            "Foreground output has shape {shape:?}, expected at least 2 dimensions"
        )));
    }
    let (height, width) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    let data: Vec<f32> = output.iter().take(height * width).copied().collect();
    Array2::from_shape_vec((height, width), data)
        .map_err(|e| CutoutError::inference(format!("Invalid foreground plane: {e}")))
}

/// Stretch values to `[0, 1]`; a flat plane is left as is
fn normalize_min_max(plane: &mut Array2<f32>) {
    let (min, max) = plane
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        return;
    }
    plane.mapv_inplace(|v| (v - min) / range);
}

pub(crate) fn decode_prediction(
    output: &ArrayD<f32>,
    letterbox: &Letterbox,
    params: &ForegroundParams,
) -> Result<Mask> {
    let mut plane = prediction_plane(output)?;
    if params.normalize_prediction {
        normalize_min_max(&mut plane);
    }
    let mask = letterbox.crop_plane(&plane.view())?;
    Ok(mask.with_measured_area((letterbox.source_width, letterbox.source_height)))
}

#[async_trait]
impl Segmenter for ForegroundSegmenter {
    async fn segment(&self, image: &SourceImage, config: &PipelineConfig) -> Result<Vec<Mask>> {
        let params = &config.foreground;
        let preprocessing = PreprocessingConfig::foreground(
            params.input_size,
            params.normalization_mean,
            params.normalization_std,
        );
        let (tensor, letterbox) = ImagePreprocessor::preprocess(image.rgb(), &preprocessing)?;

        let outputs = self.slot.run(vec![tensor.into_dyn()]).await?;
        let output = outputs.tensors().first().ok_or_else(|| {
            CutoutError::inference("Foreground model produced no outputs")
        })?;

        let mask = decode_prediction(output, &letterbox, params)?;
        debug!(
            width = mask.width(),
            height = mask.height(),
            area = mask.area(),
            "Foreground mask"
        );
        Ok(vec![mask])
    }

    fn kind(&self) -> SegmenterKind {
        SegmenterKind::Foreground
    }

    fn natural_signal(&self) -> MaskSignal {
        MaskSignal::Area
    }

    async fn warm_up(&self) -> Result<Option<Duration>> {
        self.slot.warm_up().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{model_dir_with, ScriptedBackend, ScriptedFactory};
    use crate::config::BackendType;
    use crate::inference::BackendSettings;
    use crate::models::{ModelManager, ModelSource};
    use crate::utils::PadAnchor;
    use image::RgbImage;
    use ndarray::IxDyn;

    fn params(normalize: bool) -> ForegroundParams {
        ForegroundParams {
            input_size: 8,
            normalize_prediction: normalize,
            ..ForegroundParams::default()
        }
    }

    #[test]
    fn test_min_max_normalization() {
        let mut plane = Array2::from_shape_vec((1, 3), vec![2.0, 3.0, 4.0]).unwrap();
        normalize_min_max(&mut plane);
        assert_eq!(plane.as_slice().unwrap(), &[0.0, 0.5, 1.0]);

        let mut flat = Array2::from_elem((2, 2), 0.3);
        normalize_min_max(&mut flat);
        assert!(flat.iter().all(|&v| (v - 0.3).abs() < 1e-6));
    }

    #[test]
    fn test_decode_crops_letterbox_padding() {
        // 16x8 source on an 8x8 canvas: content occupies rows 2..6
        let letterbox = Letterbox::new((16, 8), 8, PadAnchor::Center);
        let output = ArrayD::from_shape_fn(IxDyn(&[1, 1, 8, 8]), |idx| {
            if (2..6).contains(&idx[2]) && idx[3] < 4 {
                1.0
            } else {
                0.0
            }
        });

        let mask = decode_prediction(&output, &letterbox, &params(false)).unwrap();
        assert_eq!(mask.dimensions(), (8, 4));
        assert_eq!(mask.coverage(0.5), 16);
        // half of the 16x8 source
        assert!((mask.area().unwrap() - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_scalar_output() {
        let letterbox = Letterbox::new((4, 4), 4, PadAnchor::Center);
        let output = ArrayD::zeros(IxDyn(&[4]));
        assert!(decode_prediction(&output, &letterbox, &params(true)).is_err());
    }

    #[tokio::test]
    async fn test_segment_yields_exactly_one_mask() {
        let dir = model_dir_with(&["u2net.onnx"]);
        let backend = ScriptedBackend::new(&["input.1"], &["1959"], |inputs| {
            let shape = inputs[0].shape();
            assert_eq!(shape, &[1, 3, 8, 8]);
            Ok(vec![ArrayD::from_elem(IxDyn(&[1, 1, 8, 8]), 0.2)])
        });
        let factory = Arc::new(ScriptedFactory::new().with("u2net.onnx", backend));
        let slot = Arc::new(EngineSlot::new(
            "foreground",
            ModelSource::Named("u2net.onnx".into()),
            BackendType::default(),
            BackendSettings::default(),
            factory,
            ModelManager::new(dir.path()),
        ));
        let segmenter = ForegroundSegmenter::new(slot);
        let config = PipelineConfig::builder().foreground(params(false)).build().unwrap();
        let image = SourceImage::from_rgb(RgbImage::new(8, 8));

        let masks = segmenter.segment(&image, &config).await.unwrap();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].area(), Some(0.0));
        assert!(masks[0].confidence().is_none());
    }
}
