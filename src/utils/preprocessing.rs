//! Shared image preprocessing utilities
//!
//! Every segmenter feeds its model a square canvas: the source is resized with
//! its aspect ratio preserved and padded. [`Letterbox`] records that transform so
//! model-space planes can be mapped back onto source pixels.

use crate::error::{CutoutError, Result};
use crate::types::Mask;
use image::{ImageBuffer, RgbImage};
use ndarray::{Array4, ArrayView2};

/// Where the resized image sits on the square canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadAnchor {
    /// Equal padding on both sides (salient-object and YOLO models)
    Center,
    /// Padding only right and bottom (SAM encoders)
    TopLeft,
}

/// Model input preprocessing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Side of the square model input
    pub target_size: u32,
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
    /// Padding color (RGB)
    pub padding_color: [u8; 3],
    pub anchor: PadAnchor,
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl PreprocessingConfig {
    /// YOLO-style input: `[0, 1]` scaling, gray 114 padding, centered
    #[must_use]
    pub fn yolo(imgsz: u32) -> Self {
        Self {
            target_size: imgsz,
            normalization_mean: [0.0; 3],
            normalization_std: [1.0; 3],
            padding_color: [114, 114, 114],
            anchor: PadAnchor::Center,
        }
    }

    /// SAM image encoder input: longest side to `size`, zero padding bottom-right
    #[must_use]
    pub fn sam(size: u32) -> Self {
        Self {
            target_size: size,
            normalization_mean: IMAGENET_MEAN,
            normalization_std: IMAGENET_STD,
            padding_color: [124, 116, 104],
            anchor: PadAnchor::TopLeft,
        }
    }

    /// Salient-object model input
    #[must_use]
    pub fn foreground(size: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            target_size: size,
            normalization_mean: mean,
            normalization_std: std,
            padding_color: [255, 255, 255],
            anchor: PadAnchor::Center,
        }
    }
}

/// Aspect-preserving resize plus padding, and its inverse
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Scale factor applied to source pixels
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub target_size: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    #[must_use]
    pub fn new(source: (u32, u32), target_size: u32, anchor: PadAnchor) -> Self {
        let (source_width, source_height) = source;
        let target = target_size as f32;
        let scale = (target / source_width.max(1) as f32).min(target / source_height.max(1) as f32);

        let scaled_width = ((source_width as f32 * scale).round() as u32).clamp(1, target_size);
        let scaled_height = ((source_height as f32 * scale).round() as u32).clamp(1, target_size);

        let (offset_x, offset_y) = match anchor {
            PadAnchor::Center => (
                (target_size - scaled_width) / 2,
                (target_size - scaled_height) / 2,
            ),
            PadAnchor::TopLeft => (0, 0),
        };

        Self {
            scale,
            offset_x,
            offset_y,
            scaled_width,
            scaled_height,
            target_size,
            source_width,
            source_height,
        }
    }

    /// Source pixel coordinates to model-canvas coordinates
    #[must_use]
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.offset_x as f32,
            y * self.scale + self.offset_y as f32,
        )
    }

    /// Model-canvas coordinates to source pixel coordinates
    #[must_use]
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }

    /// Image content of a plane covering the whole canvas, at the plane's resolution
    ///
    /// Padding is cut away; the result is not resampled to source size.
    ///
    /// # Errors
    /// - Empty plane
    pub fn crop_plane(&self, plane: &ArrayView2<'_, f32>) -> Result<Mask> {
        let (plane_height, plane_width) = plane.dim();
        if plane_width == 0 || plane_height == 0 {
            return Err(CutoutError::inference("Empty mask plane"));
        }
        let fx = plane_width as f32 / self.target_size as f32;
        let fy = plane_height as f32 / self.target_size as f32;

        let x0 = ((self.offset_x as f32 * fx).floor() as usize).min(plane_width - 1);
        let y0 = ((self.offset_y as f32 * fy).floor() as usize).min(plane_height - 1);
        let x1 = (((self.offset_x + self.scaled_width) as f32 * fx).ceil() as usize)
            .clamp(x0 + 1, plane_width);
        let y1 = (((self.offset_y + self.scaled_height) as f32 * fy).ceil() as usize)
            .clamp(y0 + 1, plane_height);

        let width = (x1 - x0) as u32;
        let height = (y1 - y0) as u32;
        Ok(Mask::from_fn(width, height, |x, y| {
            plane
                .get([y0 + y as usize, x0 + x as usize])
                .copied()
                .unwrap_or(0.0)
        }))
    }

    /// Sample a plane covering the whole canvas at every source pixel (nearest)
    #[must_use]
    pub fn plane_to_source(&self, plane: &ArrayView2<'_, f32>) -> Mask {
        let (plane_height, plane_width) = plane.dim();
        let fx = plane_width as f32 / self.target_size as f32;
        let fy = plane_height as f32 / self.target_size as f32;

        Mask::from_fn(self.source_width, self.source_height, |x, y| {
            let (mx, my) = self.to_model(x as f32 + 0.5, y as f32 + 0.5);
            let px = (mx * fx).floor();
            let py = (my * fy).floor();
            if px < 0.0 || py < 0.0 {
                return 0.0;
            }
            plane
                .get([py as usize, px as usize])
                .copied()
                .unwrap_or(0.0)
        })
    }
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Letterbox `image` onto the model canvas and normalize to an NCHW tensor
    ///
    /// # Errors
    /// - Zero target size
    pub fn preprocess(
        image: &RgbImage,
        config: &PreprocessingConfig,
    ) -> Result<(Array4<f32>, Letterbox)> {
        if config.target_size == 0 {
            return Err(CutoutError::invalid_config("Model input size must be non-zero"));
        }
        let letterbox = Letterbox::new(image.dimensions(), config.target_size, config.anchor);

        let resized = image::imageops::resize(
            image,
            letterbox.scaled_width,
            letterbox.scaled_height,
            image::imageops::FilterType::Triangle,
        );

        let padding = config.padding_color;
        let mut canvas = ImageBuffer::from_pixel(
            config.target_size,
            config.target_size,
            image::Rgb([padding[0], padding[1], padding[2]]),
        );
        image::imageops::replace(
            &mut canvas,
            &resized,
            i64::from(letterbox.offset_x),
            i64::from(letterbox.offset_y),
        );

        Ok((Self::canvas_to_tensor(&canvas, config), letterbox))
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in canvas.enumerate_pixels() {
            for channel in 0..3 {
                let value = (f32::from(pixel.0[channel]) / 255.0
                    - config.normalization_mean[channel])
                    / config.normalization_std[channel];
                if let Some(slot) = tensor.get_mut([0, channel, y as usize, x as usize]) {
                    *slot = value;
                }
            }
        }

        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array2;

    #[test]
    fn test_letterbox_center_geometry() {
        let letterbox = Letterbox::new((400, 300), 640, PadAnchor::Center);
        assert!((letterbox.scale - 1.6).abs() < 1e-6);
        assert_eq!(letterbox.scaled_width, 640);
        assert_eq!(letterbox.scaled_height, 480);
        assert_eq!(letterbox.offset_x, 0);
        assert_eq!(letterbox.offset_y, 80);

        let (mx, my) = letterbox.to_model(200.0, 150.0);
        assert!((mx - 320.0).abs() < 1e-4);
        assert!((my - 320.0).abs() < 1e-4);
        let (sx, sy) = letterbox.to_source(mx, my);
        assert!((sx - 200.0).abs() < 1e-3);
        assert!((sy - 150.0).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_top_left_has_no_offset() {
        let letterbox = Letterbox::new((300, 600), 1024, PadAnchor::TopLeft);
        assert_eq!((letterbox.offset_x, letterbox.offset_y), (0, 0));
        assert_eq!(letterbox.scaled_height, 1024);
        assert_eq!(letterbox.scaled_width, 512);
    }

    #[test]
    fn test_preprocess_shapes_and_padding() {
        let image = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));
        let config = PreprocessingConfig::yolo(64);

        let (tensor, letterbox) = ImagePreprocessor::preprocess(&image, &config).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(letterbox.offset_y, 16);

        // Padding row is gray 114, content row is red
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 32, 32]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 32, 32]].abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_zero_size() {
        let image = RgbImage::new(4, 4);
        let mut config = PreprocessingConfig::yolo(32);
        config.target_size = 0;
        assert!(ImagePreprocessor::preprocess(&image, &config).is_err());
    }

    #[test]
    fn test_plane_to_source_inverts_letterbox() {
        // 40x20 source in a 40x40 canvas, content rows 10..30
        let letterbox = Letterbox::new((40, 20), 40, PadAnchor::Center);
        let plane = Array2::from_shape_fn((40, 40), |(y, x)| {
            if (10..30).contains(&y) && x < 20 {
                1.0
            } else {
                0.0
            }
        });

        let mask = letterbox.plane_to_source(&plane.view());
        assert_eq!(mask.dimensions(), (40, 20));
        assert_eq!(mask.get(0, 0), 1.0);
        assert_eq!(mask.get(19, 19), 1.0);
        assert_eq!(mask.get(20, 0), 0.0);
        assert_eq!(mask.coverage(0.5), 20 * 20);
    }

    #[test]
    fn test_crop_plane_at_lower_resolution() {
        // Plane at quarter resolution of a 64 canvas holding a 64x32 image
        let letterbox = Letterbox::new((64, 32), 64, PadAnchor::Center);
        let plane = Array2::from_elem((16, 16), 0.5_f32);
        let mask = letterbox.crop_plane(&plane.view()).unwrap();
        assert_eq!(mask.dimensions(), (16, 8));
    }
}
