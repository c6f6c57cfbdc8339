//! animal-core: animal-archetype classification of face photos.
//!
//! Detects and normalizes a face, scores it with an ONNX oracle (direct
//! classifier or embedding + prototypes), then applies the business rules
//! that turn raw scores into one or two labelled percentages.

pub mod detector;
pub mod labels;
pub mod normalizer;
pub mod oracle;
pub mod pipeline;
pub mod postprocess;
pub mod registry;
pub mod settings;
pub mod types;

pub use labels::{Animal, GenderHint};
pub use pipeline::{Classifier, ClassifyError};
pub use types::{BoundingBox, Classification, Embedding, LabelScore, RawScores, ScoreDomain};

use std::path::PathBuf;

/// Model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/animalface/models")
}
