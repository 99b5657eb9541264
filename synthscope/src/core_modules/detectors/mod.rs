//! The standard detector battery.
//!
//! The registration order below is the default feature order of every model the
//! engine trains. Appending a detector changes the feature layout and requires
//! retraining; existing snapshots with the old layout are discarded on load.

pub mod blockiness;
pub mod cfa;
pub mod ela;
pub mod hos;
pub mod jpeg_ghost;
pub mod noise_residual;

use crate::core_modules::detector::DetectorRegistry;
use crate::error::Result;

pub use blockiness::Blockiness;
pub use cfa::CfaTexture;
pub use ela::ErrorLevelAnalysis;
pub use hos::WaveletStatistics;
pub use jpeg_ghost::JpegGhost;
pub use noise_residual::NoiseResidual;

pub fn standard_registry() -> Result<DetectorRegistry> {
    DetectorRegistry::new()
        .with("ela", ErrorLevelAnalysis::default())?
        .with("cfa", CfaTexture)?
        .with("hos", WaveletStatistics)?
        .with("jpeg_ghost", JpegGhost)?
        .with("noise_residual", NoiseResidual)?
        .with("blockiness", Blockiness)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_is_stable() {
        let registry = standard_registry().unwrap();
        assert_eq!(
            registry.names(),
            vec!["ela", "cfa", "hos", "jpeg_ghost", "noise_residual", "blockiness"]
        );
    }
}
