//! Colour filter array texture check on the green channel.
//!
//! Demosaicing leaves a characteristic neighbour texture in the green channel:
//! high local contrast and moderate correlation. Rendered images tend towards
//! low contrast and very high correlation between adjacent samples.

use crate::core_modules::detector::{Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper::{self, Plane};

const CONTRAST_NORMALIZER: f64 = 1000.0;
const AMPLIFICATION: f64 = 2.0;

#[derive(Debug, Clone, Default)]
pub struct CfaTexture;

impl CfaTexture {
    /// Contrast and correlation of horizontally adjacent pairs (distance 1, angle 0).
    fn neighbour_statistics(plane: &Plane) -> (f64, f64) {
        let mut left = Vec::with_capacity(plane.data.len());
        let mut right = Vec::with_capacity(plane.data.len());
        for y in 0..plane.height {
            for x in 0..plane.width - 1 {
                left.push(plane.get(x, y));
                right.push(plane.get(x + 1, y));
            }
        }
        let contrast = left.iter().zip(&right).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / left.len() as f64;

        let (mean_l, var_l) = image_helper::mean_variance(&left);
        let (mean_r, var_r) = image_helper::mean_variance(&right);
        let correlation = if var_l < 1e-12 || var_r < 1e-12 {
            // Flat texture: every pair is identical.
            1.0
        } else {
            let covariance = left
                .iter()
                .zip(&right)
                .map(|(a, b)| (a - mean_l) * (b - mean_r))
                .sum::<f64>()
                / left.len() as f64;
            covariance / (var_l.sqrt() * var_r.sqrt())
        };
        (contrast, correlation)
    }
}

impl Detector for CfaTexture {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let rgb = image_helper::decode(image_bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width < 2 || height < 1 {
            return Err(DetectorError::TooSmall { width, height });
        }
        let green = Plane::channel(&rgb, 1);
        let (contrast, correlation) = Self::neighbour_statistics(&green);

        let normalized_contrast = (contrast / CONTRAST_NORMALIZER).min(1.0);
        let score = correlation.max(0.0) * (1.0 - normalized_contrast);
        Ok(ScoreResult::Scalar((score * AMPLIFICATION).min(1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_scores_as_maximally_suspicious() {
        let bytes = image_helper::solid_png(16, 16, 90);
        assert_eq!(CfaTexture.analyze(&bytes).unwrap(), ScoreResult::Scalar(1.0));
    }

    #[test]
    fn single_column_is_too_small() {
        let bytes = image_helper::solid_png(1, 8, 90);
        assert!(matches!(CfaTexture.analyze(&bytes), Err(DetectorError::TooSmall { .. })));
    }
}
