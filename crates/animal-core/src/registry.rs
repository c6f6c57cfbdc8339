//! Class prototype registry: one mean embedding per label.
//!
//! Loaded once at startup from `{"bear": [..], "cat": [..], ...}` JSON and
//! shared read-only (behind `Arc`) by every worker.

use crate::labels::Animal;
use crate::types::{cosine_similarity, Embedding, RawScores, ScoreDomain, ScoreEntry};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read prototypes {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid prototype JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown label in prototypes: {0:?}")]
    UnknownLabel(String),
    #[error("prototype for {label} is empty")]
    Empty { label: Animal },
    #[error("prototype for {label} has {actual} dims, expected {expected}")]
    DimensionMismatch { label: Animal, expected: usize, actual: usize },
    #[error("duplicate prototype for {label}")]
    Duplicate { label: Animal },
    #[error("prototype file contains no labels")]
    NoPrototypes,
}

#[derive(Debug, Clone)]
pub struct PrototypeRegistry {
    /// Canonical label order; labels without a prototype are absent.
    prototypes: Vec<(Animal, Vec<f32>)>,
    dim: usize,
}

impl PrototypeRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json(&text)?;
        tracing::info!(
            path = %path.display(),
            labels = registry.len(),
            dim = registry.dim(),
            "loaded prototype registry"
        );
        Ok(registry)
    }

    pub fn from_json(text: &str) -> Result<Self, RegistryError> {
        let raw: HashMap<String, Vec<f32>> = serde_json::from_str(text)?;
        let mut by_label = HashMap::with_capacity(raw.len());
        for (name, vector) in raw {
            let label = name
                .parse::<Animal>()
                .map_err(|_| RegistryError::UnknownLabel(name.clone()))?;
            if by_label.insert(label, vector).is_some() {
                return Err(RegistryError::Duplicate { label });
            }
        }
        Self::from_map(by_label)
    }

    pub fn from_map(mut by_label: HashMap<Animal, Vec<f32>>) -> Result<Self, RegistryError> {
        let prototypes: Vec<(Animal, Vec<f32>)> = Animal::ALL
            .iter()
            .filter_map(|&label| by_label.remove(&label).map(|v| (label, v)))
            .collect();

        let Some((_, first)) = prototypes.first() else {
            return Err(RegistryError::NoPrototypes);
        };
        let dim = first.len();

        for (label, vector) in &prototypes {
            if vector.is_empty() {
                return Err(RegistryError::Empty { label: *label });
            }
            if vector.len() != dim {
                return Err(RegistryError::DimensionMismatch {
                    label: *label,
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        Ok(Self { prototypes, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    pub fn get(&self, label: Animal) -> Option<&[f32]> {
        self.prototypes
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, v)| v.as_slice())
    }

    /// Cosine similarity of `embedding` against every prototype.
    pub fn score(&self, embedding: &Embedding) -> RawScores {
        RawScores::new(
            ScoreDomain::Similarity,
            self.prototypes
                .iter()
                .map(|(label, proto)| ScoreEntry {
                    label: *label,
                    raw_score: cosine_similarity(&embedding.values, proto),
                })
                .collect(),
        )
    }

    /// Serialize as the same JSON shape `load` accepts.
    pub fn to_json(&self) -> Result<String, RegistryError> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .prototypes
            .iter()
            .map(|(label, v)| (label.to_string(), serde_json::json!(v)))
            .collect();
        Ok(serde_json::to_string(&map)?)
    }
}
