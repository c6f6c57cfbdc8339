//! Face normalization: image bytes → fixed-size face tensor.
//!
//! Decode, bound the resolution, detect, crop the first reported face, pad it
//! to a black square, resize to the oracle input size and map pixel values to
//! the oracle's numeric range.

use crate::detector::{DetectorError, FaceDetect};
use crate::types::PixelRect;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use thiserror::Error;

/// Longest side allowed before downscaling ahead of detection.
pub const DEFAULT_RESIZE_LIMIT: u32 = 3000;
/// Side of the square tensor the oracles expect.
pub const FACE_INPUT_SIZE: u32 = 224;
/// Mean/std used by the embedding export (per channel, after [0,1] scaling).
pub const EMBEDDING_MEAN: [f32; 3] = [0.498, 0.498, 0.498];
pub const EMBEDDING_STD: [f32; 3] = [0.25, 0.25, 0.25];

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

/// How pixel values are mapped after [0,1] scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelNormalization {
    /// Plain `v / 255`.
    UnitRange,
    /// `(v / 255 - mean[c]) / std[c]`.
    Standardized { mean: [f32; 3], std: [f32; 3] },
}

impl PixelNormalization {
    pub fn embedding_default() -> Self {
        PixelNormalization::Standardized { mean: EMBEDDING_MEAN, std: EMBEDDING_STD }
    }

    fn apply(&self, value: u8, channel: usize) -> f32 {
        let v = value as f32 / 255.0;
        match self {
            PixelNormalization::UnitRange => v,
            PixelNormalization::Standardized { mean, std } => (v - mean[channel]) / std[channel],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerConfig {
    pub resize_limit: u32,
    pub input_size: u32,
    pub normalization: PixelNormalization,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            resize_limit: DEFAULT_RESIZE_LIMIT,
            input_size: FACE_INPUT_SIZE,
            normalization: PixelNormalization::UnitRange,
        }
    }
}

/// A face crop ready for inference, NHWC `(1, size, size, 3)`.
///
/// Not `Clone`: it is handed to exactly one oracle call.
#[derive(Debug)]
pub struct NormalizedFaceImage {
    tensor: Array4<f32>,
}

impl NormalizedFaceImage {
    pub fn nhwc(&self) -> &Array4<f32> {
        &self.tensor
    }

    pub fn into_nhwc(self) -> Array4<f32> {
        self.tensor
    }

    /// Channel-first copy for models exported as NCHW.
    pub fn to_nchw(&self) -> Array4<f32> {
        self.tensor.view().permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned()
    }
}

pub struct FaceNormalizer<D> {
    detector: D,
    config: NormalizerConfig,
}

impl<D: FaceDetect> FaceNormalizer<D> {
    pub fn new(detector: D, config: NormalizerConfig) -> Self {
        Self { detector, config }
    }

    pub fn normalize(&mut self, bytes: &[u8]) -> Result<NormalizedFaceImage, NormalizeError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| NormalizeError::UnsupportedImage(e.to_string()))?;
        let image = limit_resolution(decoded.to_rgb8(), self.config.resize_limit);

        let faces = self.detector.detect(&image)?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = faces.len(),
            "face detection done"
        );

        // Only the first reported face is considered.
        let face = faces.first().ok_or(NormalizeError::NoFaceDetected)?;
        let rect = face.to_pixels(image.width(), image.height());
        if rect.width() == 0 || rect.height() == 0 {
            tracing::debug!(?rect, "face box clamps to an empty region");
            return Err(NormalizeError::NoFaceDetected);
        }

        let square = pad_to_square(&crop(&image, rect));
        Ok(self.finish(&square))
    }

    /// Resize an already-cropped face and map it to the configured range.
    pub fn finish(&self, face: &RgbImage) -> NormalizedFaceImage {
        to_tensor(face, self.config.input_size, self.config.normalization)
    }
}

/// Normalize an image that is already a face crop; no detection runs.
pub fn normalize_cropped(
    bytes: &[u8],
    input_size: u32,
    normalization: PixelNormalization,
) -> Result<NormalizedFaceImage, NormalizeError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| NormalizeError::UnsupportedImage(e.to_string()))?;
    Ok(to_tensor(&decoded.to_rgb8(), input_size, normalization))
}

/// Downscale so the longest side is at most `limit`, keeping aspect ratio.
pub fn limit_resolution(image: RgbImage, limit: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= limit {
        return image;
    }
    let scale = limit as f64 / longest as f64;
    let new_w = ((w as f64 * scale) as u32).max(1);
    let new_h = ((h as f64 * scale) as u32).max(1);
    image::imageops::resize(&image, new_w, new_h, FilterType::Lanczos3)
}

fn crop(image: &RgbImage, rect: PixelRect) -> RgbImage {
    image::imageops::crop_imm(image, rect.x1, rect.y1, rect.width(), rect.height()).to_image()
}

/// Centre `image` on a black square canvas whose side is its longer side.
pub fn pad_to_square(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let size = w.max(h);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    image::imageops::replace(
        &mut canvas,
        image,
        ((size - w) / 2) as i64,
        ((size - h) / 2) as i64,
    );
    canvas
}

fn to_tensor(face: &RgbImage, size: u32, normalization: PixelNormalization) -> NormalizedFaceImage {
    let resized = image::imageops::resize(face, size, size, FilterType::CatmullRom);
    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, side, side, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = normalization.apply(pixel[c], c);
        }
    }
    NormalizedFaceImage { tensor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use std::io::Cursor;

    /// Detector stub returning a fixed list and recording the image it saw.
    struct FixedDetector {
        faces: Vec<BoundingBox>,
        seen: Option<(u32, u32)>,
    }

    impl FaceDetect for FixedDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.seen = Some(image.dimensions());
            Ok(self.faces.clone())
        }
    }

    fn png(image: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn full_box() -> BoundingBox {
        BoundingBox { xmin: 0.0, ymin: 0.0, width: 1.0, height: 1.0, confidence: 0.9 }
    }

    fn normalizer(faces: Vec<BoundingBox>) -> FaceNormalizer<FixedDetector> {
        FaceNormalizer::new(FixedDetector { faces, seen: None }, NormalizerConfig::default())
    }

    #[test]
    fn test_garbage_bytes_unsupported() {
        let err = normalizer(vec![full_box()]).normalize(b"not an image").unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedImage(_)));
    }

    #[test]
    fn test_no_faces() {
        let bytes = png(&RgbImage::from_pixel(64, 64, Rgb([200, 100, 50])));
        let err = normalizer(vec![]).normalize(&bytes).unwrap_err();
        assert!(matches!(err, NormalizeError::NoFaceDetected));
    }

    #[test]
    fn test_degenerate_box_is_no_face() {
        let bytes = png(&RgbImage::from_pixel(64, 64, Rgb([200, 100, 50])));
        let outside = BoundingBox { xmin: 1.5, ymin: 0.0, width: 0.2, height: 0.5, confidence: 0.9 };
        let err = normalizer(vec![outside]).normalize(&bytes).unwrap_err();
        assert!(matches!(err, NormalizeError::NoFaceDetected));
    }

    #[test]
    fn test_output_shape_and_unit_range() {
        let bytes = png(&RgbImage::from_pixel(300, 200, Rgb([255, 255, 255])));
        let face = normalizer(vec![full_box()]).normalize(&bytes).unwrap();
        let t = face.nhwc();
        assert_eq!(t.shape(), &[1, 224, 224, 3]);
        assert!(t.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // top rows are black padding, centre is white
        assert_eq!(t[[0, 0, 112, 0]], 0.0);
        assert!((t[[0, 112, 112, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_detection_is_used() {
        // Left half red, right half blue; first box covers the blue half.
        let mut img = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
        for x in 100..200 {
            for y in 0..100 {
                img.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }
        let blue = BoundingBox { xmin: 0.5, ymin: 0.0, width: 0.5, height: 1.0, confidence: 0.6 };
        let red = BoundingBox { xmin: 0.0, ymin: 0.0, width: 0.5, height: 1.0, confidence: 0.99 };
        let face = normalizer(vec![blue, red]).normalize(&png(&img)).unwrap();
        let t = face.nhwc();
        assert!(t[[0, 112, 112, 0]] < 0.01);
        assert!(t[[0, 112, 112, 2]] > 0.99);
    }

    #[test]
    fn test_large_images_are_downscaled_before_detection() {
        let bytes = png(&RgbImage::from_pixel(80, 40, Rgb([10, 10, 10])));
        let config = NormalizerConfig { resize_limit: 40, ..Default::default() };
        let mut n = FaceNormalizer::new(FixedDetector { faces: vec![full_box()], seen: None }, config);
        n.normalize(&bytes).unwrap();
        assert_eq!(n.detector.seen, Some((40, 20)));
    }

    #[test]
    fn test_limit_resolution_keeps_small_images() {
        let img = RgbImage::new(100, 50);
        assert_eq!(limit_resolution(img, 3000).dimensions(), (100, 50));
    }

    #[test]
    fn test_pad_to_square_centres() {
        let img = RgbImage::from_pixel(4, 2, Rgb([9, 9, 9]));
        let sq = pad_to_square(&img);
        assert_eq!(sq.dimensions(), (4, 4));
        assert_eq!(sq.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(sq.get_pixel(0, 1), &Rgb([9, 9, 9]));
        assert_eq!(sq.get_pixel(3, 2), &Rgb([9, 9, 9]));
        assert_eq!(sq.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_pad_to_square_odd_remainder() {
        let img = RgbImage::from_pixel(2, 5, Rgb([9, 9, 9]));
        let sq = pad_to_square(&img);
        // (5 - 2) / 2 = 1 column of padding on the left
        assert_eq!(sq.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(sq.get_pixel(1, 0), &Rgb([9, 9, 9]));
        assert_eq!(sq.get_pixel(2, 4), &Rgb([9, 9, 9]));
        assert_eq!(sq.get_pixel(3, 4), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_standardized_normalization() {
        let norm = PixelNormalization::embedding_default();
        let v = norm.apply(255, 0);
        assert!((v - (1.0 - 0.498) / 0.25).abs() < 1e-6);
        let z = norm.apply(0, 2);
        assert!((z - (-0.498 / 0.25)).abs() < 1e-6);
    }

    #[test]
    fn test_nchw_layout() {
        let bytes = png(&RgbImage::from_pixel(10, 10, Rgb([255, 0, 0])));
        let face = normalize_cropped(&bytes, 8, PixelNormalization::UnitRange).unwrap();
        let nchw = face.to_nchw();
        assert_eq!(nchw.shape(), &[1, 3, 8, 8]);
        assert!((nchw[[0, 0, 4, 4]] - 1.0).abs() < 1e-6);
        assert_eq!(nchw[[0, 1, 4, 4]], 0.0);
    }
}
