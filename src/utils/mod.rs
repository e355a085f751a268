//! Shared helpers used by several segmenters

pub mod preprocessing;

pub use preprocessing::{ImagePreprocessor, Letterbox, PadAnchor, PreprocessingConfig};

/// Logistic function, used to turn mask logits into membership
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(20.0) > 0.999);
        assert!(sigmoid(-20.0) < 0.001);
    }
}
