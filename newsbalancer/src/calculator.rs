//! Composite score calculation.
//!
//! Pure and synchronous: no I/O, no clock. Given the same results and config it
//! always yields the same numbers.

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::llm::PerspectiveResult;
use crate::perspectives::{ConfidenceMethod, Formula, PerspectiveConfig};

/// Nothing usable was left after filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no valid perspective results to aggregate")]
pub struct NoValidData;

/// Per-perspective mean used as one vote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerspectiveVote {
    pub perspective_id: String,
    pub weight: f64,
    pub score: f64,
    pub confidence: f64,
    /// Number of results averaged into this vote
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub score: f64,
    pub confidence: f64,
    pub votes: Vec<PerspectiveVote>,
    /// Results dropped as invalid, failed, out of range or under min_confidence
    pub excluded: usize,
}

impl Aggregate {
    pub fn valid_perspectives(&self) -> usize {
        self.votes.len()
    }
}

/// A result takes part in aggregation only with finite, in-range numbers.
pub fn is_usable(result: &PerspectiveResult, min_confidence: f64) -> bool {
    if !result.is_valid() {
        return false;
    }
    match (result.score, result.confidence) {
        (Some(s), Some(c)) => {
            s.is_finite()
                && c.is_finite()
                && (-1.0..=1.0).contains(&s)
                && (0.0..=1.0).contains(&c)
                && c >= min_confidence
        }
        _ => false,
    }
}

/// Combine per-perspective results into one score and one confidence.
///
/// Several results for the same perspective (samples or retries) are averaged
/// into a single vote first. Results for perspectives the config does not list
/// are ignored.
pub fn aggregate(
    results: &[PerspectiveResult],
    config: &PerspectiveConfig,
) -> Result<Aggregate, NoValidData> {
    let mut sums: HashMap<&str, (f64, f64, usize)> = HashMap::new();
    let mut excluded = 0;

    for r in results {
        if !is_usable(r, config.min_confidence) {
            excluded += 1;
            continue;
        }
        if let (Some(s), Some(c)) = (r.score, r.confidence) {
            let entry = sums.entry(r.perspective_id.as_str()).or_insert((0.0, 0.0, 0));
            entry.0 += s;
            entry.1 += c;
            entry.2 += 1;
        }
    }

    // Config order keeps float summation deterministic.
    let votes: Vec<PerspectiveVote> = config
        .perspectives
        .iter()
        .filter_map(|p| {
            sums.get(p.id.as_str()).map(|&(s, c, n)| PerspectiveVote {
                perspective_id: p.id.clone(),
                weight: p.weight,
                score: s / n as f64,
                confidence: c / n as f64,
                samples: n,
            })
        })
        .collect();

    if votes.is_empty() {
        return Err(NoValidData);
    }

    let score = combine_scores(&votes, config.formula);
    let confidence = combine_confidence(&votes, config.confidence_method);

    Ok(Aggregate {
        score: score.clamp(-1.0, 1.0),
        confidence: confidence.clamp(0.0, 1.0),
        votes,
        excluded,
    })
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn combine_scores(votes: &[PerspectiveVote], formula: Formula) -> f64 {
    match formula {
        Formula::Average => mean(votes.iter().map(|v| v.score)),
        Formula::Weighted => {
            let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
            if total_weight > 0.0 {
                votes.iter().map(|v| v.weight * v.score).sum::<f64>() / total_weight
            } else {
                mean(votes.iter().map(|v| v.score))
            }
        }
    }
}

fn combine_confidence(votes: &[PerspectiveVote], method: ConfidenceMethod) -> f64 {
    match method {
        ConfidenceMethod::Average => mean(votes.iter().map(|v| v.confidence)),
        ConfidenceMethod::Min => votes.iter().map(|v| v.confidence).fold(f64::INFINITY, f64::min),
        ConfidenceMethod::Max => votes
            .iter()
            .map(|v| v.confidence)
            .fold(f64::NEG_INFINITY, f64::max),
        ConfidenceMethod::SpreadBased => {
            // Scores lie in [-1, 1] so the population variance lies in [0, 1].
            let m = mean(votes.iter().map(|v| v.score));
            let variance = mean(votes.iter().map(|v| (v.score - m).powi(2)));
            1.0 - variance
        }
    }
}
