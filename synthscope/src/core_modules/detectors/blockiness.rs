//! 8x8 block boundary energy.
//!
//! Compare the luminance step across JPEG block boundaries with the step inside
//! blocks. A ratio well above one means a block grid is imprinted in the pixels,
//! which for a supposedly pristine capture points at recompression or splicing.

use crate::core_modules::detector::{CONFIDENCE_FIELD, Detector, DetectorError, ScoreResult};
use crate::core_modules::utils::image_helper::{self, Plane};

const BLOCK: u32 = 8;

#[derive(Debug, Clone, Default)]
pub struct Blockiness;

impl Blockiness {
    fn boundary_ratio(plane: &Plane) -> f64 {
        let (mut boundary_sum, mut boundary_n) = (0.0, 0usize);
        let (mut interior_sum, mut interior_n) = (0.0, 0usize);
        for y in 0..plane.height {
            for x in 0..plane.width - 1 {
                let step = (plane.get(x + 1, y) - plane.get(x, y)).abs();
                if (x + 1) % BLOCK == 0 {
                    boundary_sum += step;
                    boundary_n += 1;
                } else {
                    interior_sum += step;
                    interior_n += 1;
                }
            }
        }
        let boundary = boundary_sum / boundary_n.max(1) as f64;
        let interior = interior_sum / interior_n.max(1) as f64;
        if boundary < 1e-9 {
            return 1.0;
        }
        boundary / interior.max(1e-3)
    }
}

impl Detector for Blockiness {
    fn analyze(&self, image_bytes: &[u8]) -> Result<ScoreResult, DetectorError> {
        let plane = Plane::luma(&image_helper::decode(image_bytes)?);
        if plane.width < BLOCK * 2 || plane.height < 1 {
            return Err(DetectorError::TooSmall {
                width: plane.width,
                height: plane.height,
            });
        }
        let ratio = Self::boundary_ratio(&plane);
        let confidence = ((ratio - 1.0) / 2.0).clamp(0.0, 1.0);
        Ok(ScoreResult::structured([(CONFIDENCE_FIELD, confidence), ("ratio", ratio)]))
    }
}
