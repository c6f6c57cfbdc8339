//! Upload envelope returned to clients.

use animal_core::{Classification, ClassifyError, LabelScore};
use serde::{Deserialize, Serialize};

/// Entries reported in `top_k`.
pub const TOP_K: usize = 3;

pub const UNKNOWN_LABEL: &str = "unknown";

const NO_MATCH_MESSAGE: &str = "No archetype matched this photo. Try another one.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalScore {
    pub animal: String,
    pub score: f32,
}

impl From<&LabelScore> for AnimalScore {
    fn from(s: &LabelScore) -> Self {
        Self {
            animal: s.label.to_string(),
            score: s.percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Set only for persisted results.
    pub id: Option<String>,
    pub main_result: AnimalScore,
    pub top_k: Vec<AnimalScore>,
    pub message: String,
    pub share_card_url: Option<String>,
}

impl UploadResponse {
    pub fn success(id: String, result: &Classification) -> Self {
        let Some(main) = result.main() else {
            return Self::unknown(NO_MATCH_MESSAGE.to_string());
        };
        Self {
            id: Some(id),
            main_result: main.into(),
            top_k: result.labels.iter().take(TOP_K).map(AnimalScore::from).collect(),
            message: main.label.message().to_string(),
            share_card_url: None,
        }
    }

    pub fn failure(err: &ClassifyError) -> Self {
        let message = match err {
            ClassifyError::EmptyCandidateSet => NO_MATCH_MESSAGE.to_string(),
            other => format!("error: {other}"),
        };
        Self::unknown(message)
    }

    pub fn unknown(message: String) -> Self {
        Self {
            id: None,
            main_result: AnimalScore {
                animal: UNKNOWN_LABEL.to_string(),
                score: 0.0,
            },
            top_k: Vec::new(),
            message,
            share_card_url: None,
        }
    }
}
