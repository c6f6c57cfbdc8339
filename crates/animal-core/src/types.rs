use crate::labels::Animal;
use serde::{Deserialize, Serialize};

/// A detected face, in coordinates normalized to the image size (0–1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Absolute pixel rectangle `[x1, x2) × [y1, y2)` inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }
}

impl BoundingBox {
    /// Convert to absolute pixels, truncating and clamping to the image.
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> PixelRect {
        let iw = image_width as f32;
        let ih = image_height as f32;
        let clamp = |v: f32, hi: u32| (v as i64).clamp(0, hi as i64) as u32;
        PixelRect {
            x1: clamp(self.xmin * iw, image_width),
            y1: clamp(self.ymin * ih, image_height),
            x2: clamp((self.xmin + self.width) * iw, image_width),
            y2: clamp((self.ymin + self.height) * ih, image_height),
        }
    }
}

/// Embedding vector produced by an embedding oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Zero-norm vectors score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Value range of the raw scores an oracle produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreDomain {
    /// Unbounded classifier outputs (logits or softmax values).
    Logits,
    /// Cosine similarity in [-1, 1].
    Similarity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub label: Animal,
    pub raw_score: f32,
}

/// Per-label raw scores in oracle iteration order.
///
/// Order matters: it breaks ties in the top-K sort.
#[derive(Debug, Clone, PartialEq)]
pub struct RawScores {
    pub domain: ScoreDomain,
    pub entries: Vec<ScoreEntry>,
}

impl RawScores {
    pub fn new(domain: ScoreDomain, entries: Vec<ScoreEntry>) -> Self {
        Self { domain, entries }
    }

    pub fn from_pairs(domain: ScoreDomain, pairs: impl IntoIterator<Item = (Animal, f32)>) -> Self {
        Self::new(
            domain,
            pairs
                .into_iter()
                .map(|(label, raw_score)| ScoreEntry { label, raw_score })
                .collect(),
        )
    }

    pub fn get(&self, label: Animal) -> Option<f32> {
        self.entries.iter().find(|e| e.label == label).map(|e| e.raw_score)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One label of a final result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    #[serde(rename = "animal")]
    pub label: Animal,
    /// Percentage rounded to one decimal place.
    #[serde(rename = "score")]
    pub percentage: f32,
}

/// Final classification: 1–2 labels in descending percentage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub labels: Vec<LabelScore>,
}

impl Classification {
    pub fn main(&self) -> Option<&LabelScore> {
        self.labels.first()
    }

    pub fn total(&self) -> f32 {
        self.labels.iter().map(|l| l.percentage).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding { values: vec![1.0, 0.0, 0.0] };
        let b = Embedding { values: vec![1.0, 0.0, 0.0] };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding { values: vec![1.0, 0.0] };
        let b = Embedding { values: vec![0.0, 1.0] };
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding { values: vec![1.0, 0.0] };
        let b = Embedding { values: vec![-1.0, 0.0] };
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0] };
        let b = Embedding { values: vec![1.0, 0.0] };
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_bbox_to_pixels_truncates() {
        let bbox = BoundingBox { xmin: 0.25, ymin: 0.1, width: 0.5, height: 0.333, confidence: 0.9 };
        let rect = bbox.to_pixels(100, 50);
        assert_eq!(rect, PixelRect { x1: 25, y1: 5, x2: 75, y2: 21 });
    }

    #[test]
    fn test_bbox_to_pixels_clamps() {
        let bbox = BoundingBox { xmin: -0.2, ymin: -0.1, width: 1.5, height: 1.5, confidence: 0.9 };
        let rect = bbox.to_pixels(200, 100);
        assert_eq!(rect, PixelRect { x1: 0, y1: 0, x2: 200, y2: 100 });
        assert_eq!(rect.width(), 200);
        assert_eq!(rect.height(), 100);
    }

    #[test]
    fn test_bbox_outside_image_is_empty() {
        let bbox = BoundingBox { xmin: 1.2, ymin: 0.0, width: 0.3, height: 0.5, confidence: 0.9 };
        let rect = bbox.to_pixels(100, 100);
        assert_eq!(rect.width(), 0);
    }

    #[test]
    fn test_label_score_serializes_as_animal_score() {
        let s = LabelScore { label: Animal::Dog, percentage: 61.2 };
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["animal"], "dog");
        assert!((json["score"].as_f64().unwrap() - 61.2).abs() < 1e-4);
    }
}
