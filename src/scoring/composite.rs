//! Weighted combination of axis scores.

use std::collections::BTreeMap;

use crate::trial::types::{ScoreAxis, Scores};

/// Combines axis scores under `weights`.
///
/// Normalizes by the sum of weights of axes that actually have a score, so
/// a missing axis is excluded rather than counted as zero. Returns `None`
/// when no weighted axis has a score.
pub fn composite_score(scores: &Scores, weights: &BTreeMap<ScoreAxis, f64>) -> Option<f64> {
    let (weighted, total) = weights
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .filter_map(|(axis, w)| scores.axis(*axis).map(|s| (s, *w)))
        .fold((0.0, 0.0), |(acc, total), (s, w)| (acc + w * s, total + w));

    (total > 0.0).then(|| weighted / total)
}
