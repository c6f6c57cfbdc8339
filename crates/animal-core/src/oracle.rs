//! Score oracles.
//!
//! Both variants sit behind [`ScoreOracle`], which turns one normalized face
//! into per-label raw scores. The variant is chosen at configuration time;
//! nothing downstream inspects which one produced the scores beyond the
//! declared [`ScoreDomain`].

use crate::labels::{Animal, LABEL_COUNT};
use crate::normalizer::NormalizedFaceImage;
use crate::registry::PrototypeRegistry;
use crate::types::{Embedding, RawScores, ScoreDomain};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding has {actual} dims, prototypes have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pretrained model producing per-label raw scores for a face.
///
/// Implementations hold mutable interpreter state; one instance must only be
/// driven by one thread at a time.
pub trait ScoreOracle {
    fn domain(&self) -> ScoreDomain;

    /// Score a face. The face is consumed: it is valid for one call only.
    fn score(&mut self, face: NormalizedFaceImage) -> Result<RawScores, OracleError>;
}

/// Memory layout the exported model expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputLayout {
    #[default]
    Nhwc,
    Nchw,
}

impl InputLayout {
    fn arrange(self, face: NormalizedFaceImage) -> Array4<f32> {
        match self {
            InputLayout::Nhwc => face.into_nhwc(),
            InputLayout::Nchw => face.to_nchw(),
        }
    }
}

impl std::str::FromStr for InputLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nhwc" => Ok(InputLayout::Nhwc),
            "nchw" => Ok(InputLayout::Nchw),
            other => Err(format!("unknown input layout: {other}")),
        }
    }
}

fn load_session(model_path: &Path, kind: &str) -> Result<Session, OracleError> {
    if !model_path.exists() {
        return Err(OracleError::ModelNotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        kind,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded oracle model"
    );

    Ok(session)
}

/// Variant A: a classifier emitting one score per label.
pub struct ClassifierOracle {
    session: Session,
    labels: Vec<Animal>,
    layout: InputLayout,
}

impl ClassifierOracle {
    /// `labels` gives the model's output order; it must cover all 11 labels.
    pub fn load(
        model_path: &Path,
        labels: Vec<Animal>,
        layout: InputLayout,
    ) -> Result<Self, OracleError> {
        if labels.len() != LABEL_COUNT {
            return Err(OracleError::InferenceFailed(format!(
                "classifier needs {LABEL_COUNT} labels, got {}",
                labels.len()
            )));
        }
        let session = load_session(model_path, "classifier")?;
        Ok(Self { session, labels, layout })
    }
}

impl ScoreOracle for ClassifierOracle {
    fn domain(&self) -> ScoreDomain {
        ScoreDomain::Logits
    }

    fn score(&mut self, face: NormalizedFaceImage) -> Result<RawScores, OracleError> {
        let input = self.layout.arrange(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OracleError::InferenceFailed(format!("class scores: {e}")))?;

        scores_from_output(&self.labels, raw)
    }
}

fn scores_from_output(labels: &[Animal], raw: &[f32]) -> Result<RawScores, OracleError> {
    if raw.len() != labels.len() {
        return Err(OracleError::InferenceFailed(format!(
            "expected {} class scores, got {}",
            labels.len(),
            raw.len()
        )));
    }
    ensure_finite(RawScores::from_pairs(
        ScoreDomain::Logits,
        labels.iter().copied().zip(raw.iter().copied()),
    ))
}

/// NaN or infinite scores would turn into NaN percentages downstream.
fn ensure_finite(scores: RawScores) -> Result<RawScores, OracleError> {
    match scores.entries.iter().find(|e| !e.raw_score.is_finite()) {
        Some(bad) => Err(OracleError::InferenceFailed(format!(
            "non-finite score {} for {}",
            bad.raw_score, bad.label
        ))),
        None => Ok(scores),
    }
}

/// Produces embeddings for faces.
pub trait Embed {
    fn embed(&mut self, face: NormalizedFaceImage) -> Result<Embedding, OracleError>;
}

/// Which output tensor holds the embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingOutput {
    Index(usize),
    Name(String),
}

impl Default for EmbeddingOutput {
    fn default() -> Self {
        EmbeddingOutput::Index(0)
    }
}

impl EmbeddingOutput {
    /// Digits select by index, anything else by name.
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<usize>() {
            Ok(i) => EmbeddingOutput::Index(i),
            Err(_) => EmbeddingOutput::Name(s.trim().to_string()),
        }
    }
}

pub struct OnnxEmbedder {
    session: Session,
    output: usize,
    layout: InputLayout,
}

impl OnnxEmbedder {
    pub fn load(
        model_path: &Path,
        output: &EmbeddingOutput,
        layout: InputLayout,
    ) -> Result<Self, OracleError> {
        let session = load_session(model_path, "embedder")?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let output = match output {
            EmbeddingOutput::Index(i) if *i < names.len() => *i,
            EmbeddingOutput::Name(n) => names.iter().position(|x| x == n).ok_or_else(|| {
                OracleError::InferenceFailed(format!("no output named {n:?} in {names:?}"))
            })?,
            EmbeddingOutput::Index(i) => {
                return Err(OracleError::InferenceFailed(format!(
                    "output index {i} out of range ({} outputs)",
                    names.len()
                )))
            }
        };
        tracing::debug!(output, name = %names[output], "embedding output selected");
        Ok(Self { session, output, layout })
    }
}

impl Embed for OnnxEmbedder {
    fn embed(&mut self, face: NormalizedFaceImage) -> Result<Embedding, OracleError> {
        let input = self.layout.arrange(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[self.output]
            .try_extract_tensor::<f32>()
            .map_err(|e| OracleError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(OracleError::InferenceFailed("empty embedding".into()));
        }

        Ok(Embedding { values: raw.to_vec() })
    }
}

/// Variant B: embedding compared against the prototype registry.
pub struct EmbeddingOracle<E> {
    embedder: E,
    registry: Arc<PrototypeRegistry>,
}

impl<E: Embed> EmbeddingOracle<E> {
    pub fn new(embedder: E, registry: Arc<PrototypeRegistry>) -> Self {
        Self { embedder, registry }
    }
}

impl<E: Embed> ScoreOracle for EmbeddingOracle<E> {
    fn domain(&self) -> ScoreDomain {
        ScoreDomain::Similarity
    }

    fn score(&mut self, face: NormalizedFaceImage) -> Result<RawScores, OracleError> {
        let embedding = self.embedder.embed(face)?;
        if embedding.dim() != self.registry.dim() {
            return Err(OracleError::DimensionMismatch {
                expected: self.registry.dim(),
                actual: embedding.dim(),
            });
        }
        ensure_finite(self.registry.score(&embedding))
    }
}

/// Either oracle variant, picked from configuration.
pub enum AnyOracle {
    Classifier(ClassifierOracle),
    Embedding(EmbeddingOracle<OnnxEmbedder>),
}

impl ScoreOracle for AnyOracle {
    fn domain(&self) -> ScoreDomain {
        match self {
            AnyOracle::Classifier(o) => o.domain(),
            AnyOracle::Embedding(o) => o.domain(),
        }
    }

    fn score(&mut self, face: NormalizedFaceImage) -> Result<RawScores, OracleError> {
        match self {
            AnyOracle::Classifier(o) => o.score(face),
            AnyOracle::Embedding(o) => o.score(face),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{normalize_cropped, PixelNormalization};
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    struct FixedEmbedder(Vec<f32>);

    impl Embed for FixedEmbedder {
        fn embed(&mut self, _face: NormalizedFaceImage) -> Result<Embedding, OracleError> {
            Ok(Embedding { values: self.0.clone() })
        }
    }

    fn face() -> NormalizedFaceImage {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        normalize_cropped(buf.get_ref(), 4, PixelNormalization::UnitRange).unwrap()
    }

    fn registry() -> Arc<PrototypeRegistry> {
        Arc::new(
            PrototypeRegistry::from_json(r#"{"bear": [1, 0, 0], "cat": [0, 1, 0], "dog": [0, 0, 1]}"#)
                .unwrap(),
        )
    }

    #[test]
    fn test_embedding_oracle_scores_similarity() {
        let mut oracle = EmbeddingOracle::new(FixedEmbedder(vec![0.0, 2.0, 0.0]), registry());
        assert_eq!(oracle.domain(), ScoreDomain::Similarity);
        let scores = oracle.score(face()).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores.get(Animal::Cat).unwrap() - 1.0).abs() < 1e-6);
        assert!(scores.get(Animal::Bear).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_embedding_oracle_rejects_wrong_dimension() {
        let mut oracle = EmbeddingOracle::new(FixedEmbedder(vec![1.0, 0.0]), registry());
        let err = oracle.score(face()).unwrap_err();
        assert!(matches!(err, OracleError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_scores_from_output_zips_labels() {
        let raw: Vec<f32> = (0..LABEL_COUNT).map(|i| i as f32).collect();
        let scores = scores_from_output(&Animal::ALL, &raw).unwrap();
        assert_eq!(scores.domain, ScoreDomain::Logits);
        assert_eq!(scores.get(Animal::Bear), Some(0.0));
        assert_eq!(scores.get(Animal::Deer), Some(10.0));
    }

    #[test]
    fn test_scores_from_output_wrong_length() {
        let err = scores_from_output(&Animal::ALL, &[0.1, 0.2]).unwrap_err();
        assert!(matches!(err, OracleError::InferenceFailed(_)));
    }

    #[test]
    fn test_scores_from_output_rejects_nan() {
        let mut raw = vec![0.5f32; LABEL_COUNT];
        raw[3] = f32::NAN;
        let err = scores_from_output(&Animal::ALL, &raw).unwrap_err();
        assert!(matches!(err, OracleError::InferenceFailed(_)));

        raw[3] = f32::INFINITY;
        assert!(scores_from_output(&Animal::ALL, &raw).is_err());
    }

    #[test]
    fn test_embedding_oracle_rejects_nan_embedding() {
        let mut oracle = EmbeddingOracle::new(FixedEmbedder(vec![f32::NAN, 1.0, 0.0]), registry());
        let err = oracle.score(face()).unwrap_err();
        assert!(matches!(err, OracleError::InferenceFailed(_)));
    }

    #[test]
    fn test_layout_parse() {
        assert_eq!("NCHW".parse::<InputLayout>(), Ok(InputLayout::Nchw));
        assert_eq!("nhwc".parse::<InputLayout>(), Ok(InputLayout::Nhwc));
        assert!("chw".parse::<InputLayout>().is_err());
    }

    #[test]
    fn test_embedding_output_parse() {
        assert_eq!(EmbeddingOutput::parse("173"), EmbeddingOutput::Index(173));
        assert_eq!(EmbeddingOutput::parse("pool"), EmbeddingOutput::Name("pool".into()));
    }

    #[test]
    fn test_arrange_nchw() {
        let input = InputLayout::Nchw.arrange(face());
        assert_eq!(input.shape(), &[1, 3, 4, 4]);
    }
}
