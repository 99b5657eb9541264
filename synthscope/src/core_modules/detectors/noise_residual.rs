//! Sensor noise residual.
//!
//! A camera sensor leaves broadband noise that survives a Laplacian high-pass.
//! Rendered images are often too clean. Reports the residual spread alongside
//! the confidence so callers can inspect the raw measurement.

use crate::core_modules::detector::{CONFIDENCE_FIELD, Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper::{self, Plane};

/// Residual standard deviation considered fully camera-like.
const NATURAL_RESIDUAL_STD: f64 = 8.0;

#[derive(Debug, Clone, Default)]
pub struct NoiseResidual;

impl NoiseResidual {
    fn laplacian_residuals(plane: &Plane) -> Vec<f64> {
        let mut residuals = Vec::with_capacity(plane.data.len());
        for y in 1..plane.height - 1 {
            for x in 1..plane.width - 1 {
                let center = plane.get(x, y);
                let neighbours = plane.get(x - 1, y) + plane.get(x + 1, y) + plane.get(x, y - 1) + plane.get(x, y + 1);
                residuals.push(4.0 * center - neighbours);
            }
        }
        residuals
    }
}

impl Detector for NoiseResidual {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let plane = Plane::luma(&image_helper::decode(image_bytes)?);
        if plane.width < 3 || plane.height < 3 {
            return Err(DetectorError::TooSmall {
                width: plane.width,
                height: plane.height,
            });
        }
        let residuals = Self::laplacian_residuals(&plane);
        let (_, variance) = image_helper::mean_variance(&residuals);
        let residual_std = variance.sqrt();
        let confidence = 1.0 - (residual_std / NATURAL_RESIDUAL_STD).min(1.0);
        Ok(ScoreResult::structured([
            (CONFIDENCE_FIELD, confidence),
            ("residual_std", residual_std),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_is_noise_free() {
        let result = NoiseResidual.analyze(&image_helper::solid_png(12, 12, 40)).unwrap();
        assert_eq!(result.canonical(), Some(1.0));
        let ScoreResult::Structured(fields) = result else {
            panic!("expected a structured result");
        };
        assert_eq!(fields["residual_std"], 0.0);
    }
}
