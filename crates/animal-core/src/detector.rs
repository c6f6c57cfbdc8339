//! Face detection.
//!
//! [`FaceDetect`] is the seam the normalizer depends on. [`ScrfdDetector`]
//! implements it with an SCRFD ONNX model and reports boxes normalized to the
//! image it was given, most confident first.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use std::path::Path;
use thiserror::Error;

/// Square network input side.
const INPUT_SIDE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in an RGB image.
///
/// Implementations return detections in their own reporting order; callers
/// that only want one face take the first.
pub trait FaceDetect {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// How an image was fitted into the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    scaled: (u32, u32),
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let side = INPUT_SIDE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIDE);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIDE);
        Self {
            scale,
            scaled: (scaled_w, scaled_h),
            pad_x: (INPUT_SIDE - scaled_w) as f32 / 2.0,
            pad_y: (INPUT_SIDE - scaled_h) as f32 / 2.0,
        }
    }

    /// Network-input coordinates back to source-image pixels.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Where each stride's score and box tensors sit among the model outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputMap {
    score: [usize; 3],
    bbox: [usize; 3],
}

impl OutputMap {
    const POSITIONAL: OutputMap = OutputMap {
        score: [0, 1, 2],
        bbox: [3, 4, 5],
    };

    /// Map `score_<stride>` / `bbox_<stride>` outputs by name, or fall back to
    /// the common export order (scores first, then boxes).
    fn from_names(names: &[String]) -> Self {
        let index_of = |kind: &str, stride: usize| {
            let wanted = format!("{kind}_{stride}");
            names.iter().position(|n| *n == wanted)
        };

        let mut map = OutputMap { score: [0; 3], bbox: [0; 3] };
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (Some(score), Some(bbox)) = (index_of("score", stride), index_of("bbox", stride)) else {
                tracing::info!(?names, "detector outputs unnamed; assuming positional order");
                return Self::POSITIONAL;
            };
            map.score[level] = score;
            map.bbox[level] = bbox;
        }
        map
    }
}

/// A candidate box in source-image pixels, corner form.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    fn normalized(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        BoundingBox {
            xmin: self.x1 / w,
            ymin: self.y1 / h,
            width: (self.x2 - self.x1) / w,
            height: (self.y2 - self.y1) / h,
            confidence: self.score,
        }
    }
}

/// SCRFD face detector (anchor-free heads at strides 8, 16 and 32).
pub struct ScrfdDetector {
    session: Session,
    score_threshold: f32,
    outputs: OutputMap,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded face detector");

        if names.len() < 2 * STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "detector needs a score and a box output per stride, model has {} outputs",
                names.len()
            )));
        }

        let outputs = OutputMap::from_names(&names);
        tracing::debug!(?outputs, "detector output mapping");

        Ok(Self {
            session,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            outputs,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }
}

/// Resize into the letterbox and lay out as a standardized NCHW tensor.
/// Padding is left at zero, the standardized value of `PIXEL_MEAN`.
fn letterbox_tensor(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let fit = Letterbox::fit(width, height);
    let (scaled_w, scaled_h) = fit.scaled;
    let resized = image::imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);

    let side = INPUT_SIDE as usize;
    let (left, top) = (fit.pad_x as usize, fit.pad_y as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in resized.enumerate_pixels() {
        let (col, row) = (left + x as usize, top + y as usize);
        if col >= side || row >= side {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, row, col]] = (px[c] as f32 - PIXEL_MEAN) / PIXEL_SCALE;
        }
    }
    (tensor, fit)
}

impl FaceDetect for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, fit) = letterbox_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let scores = extract(&outputs[self.outputs.score[level]], "scores", stride)?;
            let boxes = extract(&outputs[self.outputs.bbox[level]], "boxes", stride)?;
            decode_level(scores, boxes, stride, &fit, self.score_threshold, &mut candidates);
        }

        let faces = non_max_suppression(candidates, NMS_IOU);
        tracing::debug!(faces = faces.len(), "faces detected");

        let (width, height) = image.dimensions();
        Ok(faces.iter().map(|c| c.normalized(width, height)).collect())
    }
}

fn extract<'a>(value: &'a DynValue, what: &str, stride: usize) -> Result<&'a [f32], DetectorError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {stride}: {e}")))
}

/// Decode one stride level. Box regressions are (left, top, right, bottom)
/// distances from the anchor point, in stride units.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    fit: &Letterbox,
    threshold: f32,
    out: &mut Vec<Candidate>,
) {
    let cells = INPUT_SIDE as usize / stride;
    let step = stride as f32;

    for (anchor, &score) in scores.iter().enumerate().take(cells * cells * ANCHORS_PER_CELL) {
        if score <= threshold {
            continue;
        }
        let Some(d) = boxes.get(anchor * 4..anchor * 4 + 4) else {
            break;
        };
        let cell = anchor / ANCHORS_PER_CELL;
        let cx = (cell % cells) as f32 * step;
        let cy = (cell / cells) as f32 * step;

        let (x1, y1) = fit.unmap(cx - d[0] * step, cy - d[1] * step);
        let (x2, y2) = fit.unmap(cx + d[2] * step, cy + d[3] * step);
        out.push(Candidate { x1, y1, x2, y2, score });
    }
}

/// Greedy NMS; the result is ordered by descending score.
fn non_max_suppression(mut candidates: Vec<Candidate>, max_iou: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| k.iou(&c) <= max_iou) {
            kept.push(c);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&cand(20.0, 20.0, 30.0, 30.0, 1.0)), 0.0);
        // half-width shift: 50 shared over 150 covered
        assert!((a.iou(&cand(5.0, 0.0, 15.0, 10.0, 1.0)) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_and_orders_by_score() {
        let kept = non_max_suppression(
            vec![
                cand(200.0, 200.0, 250.0, 250.0, 0.7),
                cand(5.0, 5.0, 105.0, 105.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            NMS_IOU,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert!(non_max_suppression(vec![], NMS_IOU).is_empty());
    }

    #[test]
    fn test_candidate_normalized() {
        let b = cand(50.0, 20.0, 150.0, 60.0, 0.8).normalized(200, 80);
        assert!((b.xmin - 0.25).abs() < 1e-6);
        assert!((b.ymin - 0.25).abs() < 1e-6);
        assert!((b.width - 0.5).abs() < 1e-6);
        assert!((b.height - 0.5).abs() < 1e-6);
        assert_eq!(b.confidence, 0.8);
    }

    #[test]
    fn test_decode_level_unmaps_letterbox() {
        let stride = 32;
        let cells = INPUT_SIDE as usize / stride;
        let mut scores = vec![0.0f32; cells * cells * ANCHORS_PER_CELL];
        // first anchor of cell (1, 1): anchor point (32, 32)
        let anchor = (cells + 1) * ANCHORS_PER_CELL;
        scores[anchor] = 0.9;
        let mut boxes = vec![0.0f32; scores.len() * 4];
        boxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let fit = Letterbox { scale: 2.0, scaled: (640, 480), pad_x: 0.0, pad_y: 80.0 };
        let mut out = Vec::new();
        decode_level(&scores, &boxes, stride, &fit, 0.5, &mut out);

        assert_eq!(out.len(), 1);
        // input-space box is [16, 48] on both axes
        assert!((out[0].x1 - 8.0).abs() < 1e-4);
        assert!((out[0].x2 - 24.0).abs() < 1e-4);
        assert!((out[0].y1 - (16.0 - 80.0) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_level_threshold_is_exclusive() {
        let scores = vec![0.5f32; 400 * ANCHORS_PER_CELL];
        let boxes = vec![1.0f32; scores.len() * 4];
        let fit = Letterbox::fit(640, 640);
        let mut out = Vec::new();
        decode_level(&scores, &boxes, 32, &fit, 0.5, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_letterbox_tensor_pads_short_side() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, fit) = letterbox_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((fit.scale - 2.0).abs() < 1e-6);
        assert!((fit.pad_y - 160.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        let white = (255.0 - PIXEL_MEAN) / PIXEL_SCALE;
        assert!((tensor[[0, 1, 320, 320]] - white).abs() < 1e-6);
    }

    #[test]
    fn test_output_map_by_name() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = OutputMap::from_names(&names);
        assert_eq!(map.score, [1, 3, 5]);
        assert_eq!(map.bbox, [0, 2, 4]);
    }

    #[test]
    fn test_output_map_positional_fallback() {
        let names: Vec<String> = (0..6).map(|i| format!("out{i}")).collect();
        assert_eq!(OutputMap::from_names(&names), OutputMap::POSITIONAL);
    }
}
