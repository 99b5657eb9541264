//! JPEG ghosts: re-save at a ladder of qualities and look for a dip.
//!
//! For a never-compressed or once-compressed image the re-save difference falls
//! monotonically as quality rises. Content that was previously compressed at a
//! lower quality produces a local minimum (a "ghost") at that quality.

use crate::core_modules::detector::{Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper;

const QUALITY_LADDER: [u8; 5] = [50, 60, 70, 80, 90];

#[derive(Debug, Clone, Default)]
pub struct JpegGhost;

impl JpegGhost {
    /// Sum of the rises in a difference curve ordered by increasing quality,
    /// relative to its largest value.
    fn ghost_strength(curve: &[f64]) -> f64 {
        let peak = curve.iter().copied().fold(0.0_f64, f64::max);
        if peak < 1e-9 {
            return 0.0;
        }
        let rises: f64 = curve.windows(2).map(|w| (w[1] - w[0]).max(0.0)).sum();
        (rises / peak).clamp(0.0, 1.0)
    }
}

impl Detector for JpegGhost {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let original = image_helper::decode(image_bytes)?.to_rgb8();
        let (width, height) = original.dimensions();
        if width < 8 || height < 8 {
            return Err(DetectorError::TooSmall { width, height });
        }
        let mut curve = Vec::with_capacity(QUALITY_LADDER.len());
        for quality in QUALITY_LADDER {
            let resaved = image_helper::jpeg_roundtrip(&original, quality)?;
            curve.push(image_helper::mean_abs_diff(&original, &resaved));
        }
        Ok(ScoreResult::Scalar(Self::ghost_strength(&curve)))
    }
}
