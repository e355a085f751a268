//! Applying a mask as alpha over the source image

use crate::config::{AlphaMode, PipelineConfig, ResampleFilter};
use crate::types::{Cutout, Mask, SourceImage};
use image::{ImageBuffer, Rgba};
use log::debug;

/// Turns a source image plus a mask into an RGBA cutout
///
/// The output always has the source's dimensions and its RGB channels are
/// copied unchanged; only alpha comes from the mask.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Compositor {
    filter: ResampleFilter,
    alpha: AlphaMode,
}

impl Compositor {
    #[must_use]
    pub fn new(filter: ResampleFilter, alpha: AlphaMode) -> Self {
        Self { filter, alpha }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.resample_filter, config.alpha_mode)
    }

    /// Alpha for one mask value
    #[must_use]
    pub fn alpha_for(&self, value: f32) -> u8 {
        match self.alpha {
            AlphaMode::Binary { threshold } => {
                if value > threshold {
                    255
                } else {
                    0
                }
            },
            AlphaMode::Soft => (value.clamp(0.0, 1.0) * 255.0).round() as u8,
        }
    }

    /// Cut out `image` with `mask`, resampling the mask when sizes differ
    #[must_use]
    pub fn composite(&self, image: &SourceImage, mask: &Mask) -> Cutout {
        let (width, height) = image.dimensions();
        let resampled;
        let mask = if mask.dimensions() == (width, height) {
            mask
        } else {
            debug!(
                "Resampling {}x{} mask to {width}x{height} ({:?})",
                mask.width(),
                mask.height(),
                self.filter
            );
            resampled = mask.resize(width, height, self.filter);
            &resampled
        };

        let rgb = image.rgb();
        let output = ImageBuffer::from_fn(width, height, |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            Rgba([r, g, b, self.alpha_for(mask.get(x, y))])
        });
        Cutout::new(output)
    }

    /// Fully opaque copy of the source, used when nothing was detected but
    /// the image should be stored anyway
    #[must_use]
    pub fn opaque(image: &SourceImage) -> Cutout {
        let rgb = image.rgb();
        Cutout::new(ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            Rgba([r, g, b, 255])
        }))
    }
}
