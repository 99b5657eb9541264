//! Higher-order wavelet statistics.
//!
//! Natural images have heavy-tailed (high kurtosis) wavelet detail coefficients.
//! A single-level Haar decomposition is enough to separate the peaky natural
//! distribution from the flatter one typical of rendered content.

use crate::core_modules::detector::{Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper::{self, Plane};

const LOW_KURTOSIS: f64 = 3.0;
const NATURAL_KURTOSIS: f64 = 5.0;

#[derive(Debug, Clone, Default)]
pub struct WaveletStatistics;

impl WaveletStatistics {
    /// Horizontal, vertical and diagonal Haar detail coefficients.
    fn haar_details(plane: &Plane) -> Vec<f64> {
        let half_w = plane.width / 2;
        let half_h = plane.height / 2;
        let mut details = Vec::with_capacity((half_w * half_h * 3) as usize);
        for by in 0..half_h {
            for bx in 0..half_w {
                let (x, y) = (bx * 2, by * 2);
                let a = plane.get(x, y);
                let b = plane.get(x + 1, y);
                let c = plane.get(x, y + 1);
                let d = plane.get(x + 1, y + 1);
                details.push((a + b - c - d) / 2.0);
                details.push((a - b + c - d) / 2.0);
                details.push((a - b - c + d) / 2.0);
            }
        }
        details
    }

    /// Fisher (excess) kurtosis; `None` when the distribution has no spread.
    fn excess_kurtosis(values: &[f64]) -> Option<f64> {
        let (mean, variance) = image_helper::mean_variance(values);
        if variance < 1e-12 {
            return None;
        }
        let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / values.len() as f64;
        Some(m4 / variance.powi(2) - 3.0)
    }
}

impl Detector for WaveletStatistics {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let image = image_helper::decode(image_bytes)?;
        let plane = Plane::luma(&image);
        if plane.width < 2 || plane.height < 2 {
            return Err(DetectorError::TooSmall {
                width: plane.width,
                height: plane.height,
            });
        }
        let details = Self::haar_details(&plane);
        let score = match Self::excess_kurtosis(&details) {
            // No detail energy at all.
            None => 1.0,
            Some(k) if k < LOW_KURTOSIS => 1.0,
            Some(k) if k < NATURAL_KURTOSIS => 0.7,
            Some(_) => 0.1,
        };
        Ok(ScoreResult::Scalar(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kurtosis_of_spiky_distribution_is_high() {
        let mut values = vec![0.0; 200];
        values[0] = 50.0;
        values[1] = -50.0;
        assert!(WaveletStatistics::excess_kurtosis(&values).unwrap() > NATURAL_KURTOSIS);
        assert_eq!(WaveletStatistics::excess_kurtosis(&[1.0, 1.0]), None);
    }

    #[test]
    fn flat_image_has_no_detail_energy() {
        let bytes = image_helper::solid_png(8, 8, 200);
        assert_eq!(WaveletStatistics.analyze(&bytes).unwrap(), ScoreResult::Scalar(1.0));
    }
}
