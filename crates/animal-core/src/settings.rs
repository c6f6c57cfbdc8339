//! Pipeline assembly from configuration.
//!
//! Shared by the daemon (one pipeline per worker) and the CLI (one pipeline
//! in-process). The prototype registry is loaded once by the caller and
//! handed to every pipeline it builds.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::labels::{load_labels, Animal, LabelsFileError};
use crate::normalizer::{FaceNormalizer, NormalizerConfig, PixelNormalization, DEFAULT_RESIZE_LIMIT, FACE_INPUT_SIZE};
use crate::oracle::{AnyOracle, ClassifierOracle, EmbeddingOracle, EmbeddingOutput, InputLayout, OnnxEmbedder, OracleError};
use crate::pipeline::Classifier;
use crate::postprocess::{PostProcessConfig, PostProcessor, Separation, DEFAULT_SIMILARITY_CAP};
use crate::registry::{PrototypeRegistry, RegistryError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type OnnxClassifier = Classifier<ScrfdDetector, AnyOracle>;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("labels: {0}")]
    Labels(#[from] LabelsFileError),
    #[error("prototypes: {0}")]
    Registry(#[from] RegistryError),
    #[error("embedding oracle needs a prototype registry")]
    MissingRegistry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleKind {
    Classifier,
    Embedding,
}

impl std::str::FromStr for OracleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classifier" => Ok(OracleKind::Classifier),
            "embedding" => Ok(OracleKind::Embedding),
            other => Err(format!("unknown oracle variant: {other}")),
        }
    }
}

impl std::fmt::Display for OracleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OracleKind::Classifier => "classifier",
            OracleKind::Embedding => "embedding",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub oracle: OracleKind,
    pub detector_model: PathBuf,
    pub classifier_model: PathBuf,
    /// `labels.txt` for the classifier; canonical order when absent.
    pub labels: Option<PathBuf>,
    pub embedding_model: PathBuf,
    pub prototypes: PathBuf,
    pub embedding_output: EmbeddingOutput,
    pub layout: InputLayout,
    pub resize_limit: u32,
    pub detector_threshold: Option<f32>,
    pub similarity_cap: Option<f32>,
    pub separation: Option<Separation>,
    /// Overrides the per-variant pixel normalization.
    pub normalization: Option<PixelNormalization>,
}

impl PipelineSettings {
    /// Defaults rooted at `model_dir`.
    pub fn in_dir(model_dir: PathBuf, oracle: OracleKind) -> Self {
        Self {
            oracle,
            detector_model: model_dir.join("det_500m.onnx"),
            classifier_model: model_dir.join("classifier.onnx"),
            labels: None,
            embedding_model: model_dir.join("embedder.onnx"),
            prototypes: model_dir.join("mean_embeddings.json"),
            embedding_output: EmbeddingOutput::default(),
            layout: InputLayout::default(),
            resize_limit: DEFAULT_RESIZE_LIMIT,
            detector_threshold: None,
            similarity_cap: Some(DEFAULT_SIMILARITY_CAP),
            separation: None,
            normalization: None,
        }
    }

    pub fn pixel_normalization(&self) -> PixelNormalization {
        self.normalization.unwrap_or(match self.oracle {
            OracleKind::Classifier => PixelNormalization::UnitRange,
            OracleKind::Embedding => PixelNormalization::embedding_default(),
        })
    }

    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            resize_limit: self.resize_limit,
            input_size: FACE_INPUT_SIZE,
            normalization: self.pixel_normalization(),
        }
    }

    pub fn postprocess_config(&self) -> PostProcessConfig {
        PostProcessConfig {
            similarity_cap: self.similarity_cap,
            separation: self.separation,
            ..PostProcessConfig::default()
        }
    }

    /// Load the registry when the embedding variant needs one.
    pub fn load_registry(&self) -> Result<Option<Arc<PrototypeRegistry>>, BuildError> {
        match self.oracle {
            OracleKind::Classifier => Ok(None),
            OracleKind::Embedding => Ok(Some(Arc::new(PrototypeRegistry::load(&self.prototypes)?))),
        }
    }

    pub fn load_embedder(&self) -> Result<OnnxEmbedder, BuildError> {
        Ok(OnnxEmbedder::load(&self.embedding_model, &self.embedding_output, self.layout)?)
    }

    /// Build one independent pipeline (own detector and oracle sessions).
    pub fn build(
        &self,
        registry: Option<Arc<PrototypeRegistry>>,
    ) -> Result<OnnxClassifier, BuildError> {
        let mut detector = ScrfdDetector::load(&self.detector_model)?;
        if let Some(t) = self.detector_threshold {
            detector = detector.with_confidence_threshold(t);
        }

        let oracle = match self.oracle {
            OracleKind::Classifier => {
                let labels = match &self.labels {
                    Some(path) => load_labels(path)?,
                    None => Animal::ALL.to_vec(),
                };
                AnyOracle::Classifier(ClassifierOracle::load(&self.classifier_model, labels, self.layout)?)
            }
            OracleKind::Embedding => {
                let registry = registry.ok_or(BuildError::MissingRegistry)?;
                AnyOracle::Embedding(EmbeddingOracle::new(self.load_embedder()?, registry))
            }
        };

        Ok(Classifier::new(
            FaceNormalizer::new(detector, self.normalizer_config()),
            oracle,
            PostProcessor::new(self.postprocess_config()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_follows_variant() {
        let c = PipelineSettings::in_dir(PathBuf::from("/m"), OracleKind::Classifier);
        assert_eq!(c.pixel_normalization(), PixelNormalization::UnitRange);
        let e = PipelineSettings::in_dir(PathBuf::from("/m"), OracleKind::Embedding);
        assert_eq!(e.pixel_normalization(), PixelNormalization::embedding_default());
    }

    #[test]
    fn test_normalization_override() {
        let mut e = PipelineSettings::in_dir(PathBuf::from("/m"), OracleKind::Embedding);
        e.normalization = Some(PixelNormalization::UnitRange);
        assert_eq!(e.pixel_normalization(), PixelNormalization::UnitRange);
    }

    #[test]
    fn test_oracle_kind_parse() {
        assert_eq!("Embedding".parse::<OracleKind>(), Ok(OracleKind::Embedding));
        assert!("tflite".parse::<OracleKind>().is_err());
    }

    #[test]
    fn test_build_missing_detector_model() {
        let s = PipelineSettings::in_dir(PathBuf::from("/nonexistent/models"), OracleKind::Classifier);
        let err = s.build(None).err().unwrap();
        assert!(matches!(err, BuildError::Detector(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_classifier_needs_no_registry() {
        let s = PipelineSettings::in_dir(PathBuf::from("/m"), OracleKind::Classifier);
        assert!(s.load_registry().unwrap().is_none());
    }
}
