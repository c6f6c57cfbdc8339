//! End-to-end classification: bytes + gender hint → result.

use crate::detector::FaceDetect;
use crate::labels::GenderHint;
use crate::normalizer::{FaceNormalizer, NormalizeError};
use crate::oracle::{OracleError, ScoreOracle};
use crate::postprocess::{EmptyCandidateSet, PostProcessor};
use crate::types::Classification;
use thiserror::Error;

/// Every outcome of a classification other than success.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("no face detected; upload a clear frontal photo")]
    NoFaceDetected,
    #[error("inference failure: {0}")]
    InferenceFailure(String),
    #[error("no candidate labels remain after filtering")]
    EmptyCandidateSet,
}

impl ClassifyError {
    /// Whether the user can fix this by uploading a different photo.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, ClassifyError::UnsupportedImage(_) | ClassifyError::NoFaceDetected)
    }
}

impl From<NormalizeError> for ClassifyError {
    fn from(e: NormalizeError) -> Self {
        match e {
            NormalizeError::UnsupportedImage(msg) => ClassifyError::UnsupportedImage(msg),
            NormalizeError::NoFaceDetected => ClassifyError::NoFaceDetected,
            NormalizeError::Detector(err) => ClassifyError::InferenceFailure(format!("detector: {err}")),
        }
    }
}

impl From<OracleError> for ClassifyError {
    fn from(e: OracleError) -> Self {
        ClassifyError::InferenceFailure(e.to_string())
    }
}

impl From<EmptyCandidateSet> for ClassifyError {
    fn from(_: EmptyCandidateSet) -> Self {
        ClassifyError::EmptyCandidateSet
    }
}

/// One classification pipeline. Owns its detector and oracle instances, so
/// it must be driven from a single thread at a time.
pub struct Classifier<D, O> {
    normalizer: FaceNormalizer<D>,
    oracle: O,
    postprocessor: PostProcessor,
}

impl<D: FaceDetect, O: ScoreOracle> Classifier<D, O> {
    pub fn new(normalizer: FaceNormalizer<D>, oracle: O, postprocessor: PostProcessor) -> Self {
        Self { normalizer, oracle, postprocessor }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn classify(
        &mut self,
        image: &[u8],
        gender: GenderHint,
    ) -> Result<Classification, ClassifyError> {
        let face = self.normalizer.normalize(image)?;
        let raw = self.oracle.score(face)?;
        tracing::debug!(
            domain = ?raw.domain,
            scores = ?raw.entries.iter().map(|e| (e.label, e.raw_score)).collect::<Vec<_>>(),
            "oracle scores"
        );
        Ok(self.postprocessor.process(&raw, gender)?)
    }
}
