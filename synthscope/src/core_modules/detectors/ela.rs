//! Error level analysis: re-save as JPEG and measure how much the image moves.
//! Regions edited after the last compression re-compress differently from the rest.

use crate::core_modules::detector::{Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper;

const DEFAULT_QUALITY: u8 = 95;
const AMPLIFICATION: f64 = 10.0;
/// Mean amplified difference that maps to a score of 1.0.
const SATURATION_LEVEL: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct ErrorLevelAnalysis {
    pub quality: u8,
}

impl Default for ErrorLevelAnalysis {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
        }
    }
}

impl Detector for ErrorLevelAnalysis {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let original = image_helper::decode(image_bytes)?.to_rgb8();
        let resaved = image_helper::jpeg_roundtrip(&original, self.quality)?;

        let samples = original.as_raw().len();
        if samples == 0 {
            return Err(DetectorError::TooSmall { width: 0, height: 0 });
        }
        let amplified: f64 = original
            .as_raw()
            .iter()
            .zip(resaved.as_raw())
            .map(|(a, b)| (a.abs_diff(*b) as f64 * AMPLIFICATION).min(255.0))
            .sum();
        let mean = amplified / samples as f64;
        Ok(ScoreResult::Scalar((mean / SATURATION_LEVEL).min(1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_bounded() {
        let bytes = image_helper::gradient_png(48, 48);
        let ScoreResult::Scalar(score) = ErrorLevelAnalysis::default().analyze(&bytes).unwrap() else {
            panic!("expected a scalar score");
        };
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = ErrorLevelAnalysis::default().analyze(b"not an image").unwrap_err();
        assert!(matches!(err, DetectorError::Decode(_)));
    }
}
