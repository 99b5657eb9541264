// THEORY:
// The preprocessor bounds the work every detector has to do. Before fan-out an
// image whose longer edge exceeds a cap is scaled down to it (aspect ratio
// preserved), unless that would squeeze the shorter edge below a floor, in which
// case the floor sets the scale. Small images keep their size. Everything is then
// re-encoded as PNG. PNG matters: a lossy re-encode here would
// imprint fresh compression artifacts that ELA, JPEG-ghost and blockiness would
// then faithfully report.
//
// Preprocessing is best-effort. Bytes that cannot be decoded pass through
// unchanged and each detector decides for itself whether it can cope.

use image::GenericImageView;
use image::imageops::FilterType;
use tracing::{debug, warn};

use crate::core_modules::utils::image_helper;

/// How the preprocessor treated an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessStatus {
    /// Decoded and re-encoded losslessly, possibly after downscaling.
    Reencoded { width: u32, height: u32, resized: bool },
    /// Could not be decoded; the original bytes were kept.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub bytes: Vec<u8>,
    pub status: PreprocessStatus,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    max_long_edge: u32,
    min_short_edge: u32,
}

impl Preprocessor {
    pub fn new(max_long_edge: u32, min_short_edge: u32) -> Self {
        let max_long_edge = max_long_edge.max(1);
        Self {
            max_long_edge,
            min_short_edge: min_short_edge.clamp(1, max_long_edge),
        }
    }

    pub fn max_long_edge(&self) -> u32 {
        self.max_long_edge
    }

    pub fn min_short_edge(&self) -> u32 {
        self.min_short_edge
    }

    /// Target dimensions for an image of `width` x `height`. Never upscales.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let (long_edge, short_edge) = (width.max(height), width.min(height));
        if long_edge <= self.max_long_edge || short_edge == 0 {
            return (width, height);
        }
        let mut scale = self.max_long_edge as f64 / long_edge as f64;
        if (short_edge as f64 * scale).round() < self.min_short_edge as f64 {
            scale = (self.min_short_edge as f64 / short_edge as f64).min(1.0);
        }
        let scaled = |edge: u32| ((edge as f64 * scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }

    /// Deterministic: identical input bytes always yield identical output bytes.
    pub fn process(&self, image_bytes: &[u8]) -> Preprocessed {
        let image = match image_helper::decode(image_bytes) {
            Ok(image) => image,
            Err(err) => {
                warn!("Preprocessing skipped, image could not be decoded: {err}");
                return Self::passthrough(image_bytes);
            }
        };

        let (width, height) = image.dimensions();
        let (target_w, target_h) = self.target_dimensions(width, height);
        let resized = (target_w, target_h) != (width, height);
        let image = if resized {
            debug!("Downscaling {width}x{height} to {target_w}x{target_h}");
            image.resize_exact(target_w, target_h, FilterType::Lanczos3)
        } else {
            image
        };

        match image_helper::encode_png(&image) {
            Ok(bytes) => Preprocessed {
                bytes,
                status: PreprocessStatus::Reencoded {
                    width: target_w,
                    height: target_h,
                    resized,
                },
            },
            Err(err) => {
                warn!("Preprocessing skipped, PNG re-encode failed: {err}");
                Self::passthrough(image_bytes)
            }
        }
    }

    fn passthrough(image_bytes: &[u8]) -> Preprocessed {
        Preprocessed {
            bytes: image_bytes.to_vec(),
            status: PreprocessStatus::Passthrough,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_images_are_capped_on_the_long_edge() {
        let pre = Preprocessor::new(800, 256);
        assert_eq!(pre.target_dimensions(1920, 1080), (800, 450));
        assert_eq!(pre.target_dimensions(1080, 1920), (450, 800));
    }

    #[test]
    fn small_images_keep_their_size() {
        let pre = Preprocessor::new(800, 256);
        assert_eq!(pre.target_dimensions(600, 400), (600, 400));
        assert_eq!(pre.target_dimensions(100, 50), (100, 50));
    }

    #[test]
    fn extreme_aspect_ratios_keep_the_short_edge_floor() {
        let pre = Preprocessor::new(800, 256);
        assert_eq!(pre.target_dimensions(3000, 600), (1280, 256));
        assert_eq!(pre.target_dimensions(600, 3000), (256, 1280));
        assert_eq!(pre.target_dimensions(20000, 400), (12800, 256));
        // Already below the floor: no upscaling.
        assert_eq!(pre.target_dimensions(20000, 100), (20000, 100));
    }

    #[test]
    fn downscales_and_reencodes_as_png() {
        let pre = Preprocessor::new(32, 8);
        let out = pre.process(&image_helper::gradient_png(64, 32));
        assert_eq!(
            out.status,
            PreprocessStatus::Reencoded {
                width: 32,
                height: 16,
                resized: true
            }
        );
        assert_eq!(image::guess_format(&out.bytes).unwrap(), image::ImageFormat::Png);
        assert_eq!(image_helper::decode(&out.bytes).unwrap().dimensions(), (32, 16));
    }

    #[test]
    fn output_is_deterministic() {
        let pre = Preprocessor::new(20, 8);
        let input = image_helper::gradient_png(50, 40);
        assert_eq!(pre.process(&input).bytes, pre.process(&input).bytes);
    }

    #[test]
    fn undecodable_bytes_pass_through() {
        let out = Preprocessor::new(800, 256).process(b"definitely not an image");
        assert_eq!(out.status, PreprocessStatus::Passthrough);
        assert_eq!(out.bytes, b"definitely not an image");
    }
}
