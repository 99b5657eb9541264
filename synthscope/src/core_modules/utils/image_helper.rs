//! Small image codec helpers shared by the preprocessor and the detectors.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageBuffer, ImageEncoder, Rgb, RgbImage};

/// Decodes any format the `image` crate recognizes.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Lossless RGBA8 PNG encoding. Output depends only on the pixel data.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let (width, height) = image.dimensions();
    let rgba = image.to_rgba8();
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(Cursor::new(&mut buffer));
    encoder.write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)?;
    Ok(buffer)
}

/// Re-encodes an RGB image as JPEG at `quality` and decodes it back.
pub fn jpeg_roundtrip(image: &RgbImage, quality: u8) -> Result<RgbImage, image::ImageError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality);
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(decode(&buffer)?.to_rgb8())
}

/// Mean absolute per-channel difference between two equally sized RGB images.
pub fn mean_abs_diff(a: &RgbImage, b: &RgbImage) -> f64 {
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    let count = a.as_raw().len().min(b.as_raw().len());
    if count == 0 { 0.0 } else { total as f64 / count as f64 }
}

/// A single-channel floating point plane.
#[derive(Debug, Clone)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f64>,
}

impl Plane {
    /// Luminance plane of an image.
    pub fn luma(image: &DynamicImage) -> Self {
        let gray = image.to_luma8();
        Self {
            width: gray.width(),
            height: gray.height(),
            data: gray.as_raw().iter().map(|&v| v as f64).collect(),
        }
    }

    /// One RGB channel (`0 = R`, `1 = G`, `2 = B`).
    pub fn channel(image: &RgbImage, channel: usize) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.pixels().map(|p| p.0[channel] as f64).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f64 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Mean and population variance.
pub fn mean_variance(values: &[f64]) -> (f64, f64) {
    let count = values.len() as f64;
    if count < 1.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    (mean, variance)
}

/// PNG bytes of a uniform image.
pub fn solid_png(width: u32, height: u32, level: u8) -> Vec<u8> {
    let image: RgbImage = ImageBuffer::from_pixel(width, height, Rgb([level, level, level]));
    encode_png(&DynamicImage::ImageRgb8(image)).unwrap_or_default()
}

/// PNG bytes of a diagonal gradient with a little per-pixel texture.
pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let image: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
        let base = ((x + y) * 255 / (width + height).max(1)) as u8;
        let texture = ((x * 7 + y * 13) % 11) as u8;
        Rgb([base.saturating_add(texture), base, base.saturating_sub(texture)])
    });
    encode_png(&DynamicImage::ImageRgb8(image)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_encoding_is_deterministic_and_lossless() {
        let bytes = gradient_png(40, 30);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(encode_png(&decoded).unwrap(), bytes);
    }

    #[test]
    fn jpeg_roundtrip_keeps_dimensions() {
        let image = decode(&gradient_png(32, 24)).unwrap().to_rgb8();
        let resaved = jpeg_roundtrip(&image, 90).unwrap();
        assert_eq!(resaved.dimensions(), (32, 24));
        assert!(mean_abs_diff(&image, &resaved) < 20.0);
    }

    #[test]
    fn mean_variance_of_constant_is_zero() {
        assert_eq!(mean_variance(&[3.0, 3.0, 3.0]), (3.0, 0.0));
        assert_eq!(mean_variance(&[]), (0.0, 0.0));
    }
}
