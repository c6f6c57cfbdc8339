//! Score post-processing: raw per-label scores in, final result out.
//!
//! Steps run in a fixed order: gender filter, similarity cap (similarity
//! domain only), optional top-1 separation, top-K shortlist, forbidden-pair
//! filter, softmax normalization. The whole module is pure and deterministic.

use crate::labels::GenderHint;
use crate::types::{Classification, LabelScore, RawScores, ScoreDomain, ScoreEntry};
use thiserror::Error;

/// Conventional similarity ceiling.
pub const DEFAULT_SIMILARITY_CAP: f32 = 0.7;
const DEFAULT_SHORTLIST_LEN: usize = 5;
const DEFAULT_MAX_LABELS: usize = 2;

/// Every candidate was removed by the gender filter (or none was scored).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no candidate labels remain after filtering")]
pub struct EmptyCandidateSet;

/// Widen the gap between a near-tied top two after capping.
///
/// Used by the mobile embedding flavour; off by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Separation {
    /// Apply when `top1 - top2` is below this.
    pub margin: f32,
    /// Added to top1 (max 1.0) and subtracted from top2 (min 0.0).
    pub boost: f32,
}

impl Default for Separation {
    fn default() -> Self {
        Self { margin: 0.03, boost: 0.05 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessConfig {
    /// Ceiling for similarity scores. `None` disables capping.
    pub similarity_cap: Option<f32>,
    pub separation: Option<Separation>,
    pub shortlist_len: usize,
    pub max_labels: usize,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            similarity_cap: Some(DEFAULT_SIMILARITY_CAP),
            separation: None,
            shortlist_len: DEFAULT_SHORTLIST_LEN,
            max_labels: DEFAULT_MAX_LABELS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostProcessor {
    config: PostProcessConfig,
}

impl PostProcessor {
    pub fn new(config: PostProcessConfig) -> Self {
        Self { config }
    }

    /// Turn raw scores into a ranked, filtered, normalized result.
    pub fn process(
        &self,
        raw: &RawScores,
        gender: GenderHint,
    ) -> Result<Classification, EmptyCandidateSet> {
        let mut scores = gender_filter(&raw.entries, gender);

        if raw.domain == ScoreDomain::Similarity {
            if let Some(cap) = self.config.similarity_cap {
                cap_similarity(&mut scores, cap);
            }
            if let Some(sep) = self.config.separation {
                separate_top(&mut scores, sep);
            }
        }

        let shortlist = shortlist(&scores, self.config.shortlist_len);
        let selected = filter_forbidden_pairs(&shortlist, self.config.max_labels);

        tracing::debug!(
            candidates = scores.len(),
            shortlist = ?shortlist.iter().map(|e| e.label).collect::<Vec<_>>(),
            selected = ?selected.iter().map(|e| e.label).collect::<Vec<_>>(),
            "post-processed scores"
        );

        if selected.is_empty() {
            return Err(EmptyCandidateSet);
        }

        let labels = softmax_percentages(&selected)
            .into_iter()
            .zip(selected.iter())
            .map(|(percentage, entry)| LabelScore { label: entry.label, percentage })
            .collect();

        Ok(Classification { labels })
    }
}

/// Drop labels the hint excludes, keeping input order.
pub fn gender_filter(entries: &[ScoreEntry], gender: GenderHint) -> Vec<ScoreEntry> {
    entries
        .iter()
        .filter(|e| !e.label.excluded_by(gender))
        .copied()
        .collect()
}

/// Rescale so the maximum is exactly `cap` when it exceeds it.
pub fn cap_similarity(entries: &mut [ScoreEntry], cap: f32) {
    let Some(max) = max_score(entries) else {
        return;
    };
    if max > cap {
        let scale = cap / max;
        for e in entries.iter_mut() {
            // cap / max * max can land one ulp off the cap
            e.raw_score = if e.raw_score == max { cap } else { e.raw_score * scale };
        }
    }
}

fn separate_top(entries: &mut [ScoreEntry], sep: Separation) {
    let ranked = shortlist(entries, 2);
    let [first, second] = ranked.as_slice() else {
        return;
    };
    if first.raw_score - second.raw_score < sep.margin {
        for e in entries.iter_mut() {
            if e.label == first.label {
                e.raw_score = (first.raw_score + sep.boost).min(1.0);
            } else if e.label == second.label {
                e.raw_score = (second.raw_score - sep.boost).max(0.0);
            }
        }
    }
}

/// Stable descending sort, truncated to `len`. Ties keep input order.
pub fn shortlist(entries: &[ScoreEntry], len: usize) -> Vec<ScoreEntry> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(len);
    sorted
}

/// Greedily accept labels that do not conflict with any already accepted.
pub fn filter_forbidden_pairs(shortlist: &[ScoreEntry], max_labels: usize) -> Vec<ScoreEntry> {
    let mut accepted: Vec<ScoreEntry> = Vec::with_capacity(max_labels);
    for entry in shortlist {
        if accepted.len() >= max_labels {
            break;
        }
        let conflict = accepted.iter().any(|a| a.label.conflicts_with(entry.label));
        if !conflict {
            accepted.push(*entry);
        }
    }
    accepted
}

/// Numerically stable softmax, as percentages rounded to one decimal.
fn softmax_percentages(selected: &[ScoreEntry]) -> Vec<f32> {
    let max = selected
        .iter()
        .map(|e| e.raw_score as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = selected
        .iter()
        .map(|e| (e.raw_score as f64 - max).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.iter()
        .map(|x| round_one_decimal(x / sum * 100.0))
        .collect()
}

fn round_one_decimal(pct: f64) -> f32 {
    ((pct * 10.0).round() / 10.0) as f32
}

fn max_score(entries: &[ScoreEntry]) -> Option<f32> {
    entries
        .iter()
        .map(|e| e.raw_score)
        .fold(None, |acc, s| Some(acc.map_or(s, |m: f32| m.max(s))))
}
