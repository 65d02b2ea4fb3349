//! Relevance scoring: two similarity signals in, one bounded score out.
//!
//! `cosine` carries direct topical relevance and dominates; `chamfer` rewards
//! passages that cover every aspect of a multi-part query.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use citelens_shared::{Passage, PassageSimilarities, Query, SimilarityPair};

use crate::assignment::{PassageScores, QueryScore, normalize_queries};

/// Weight of the cosine signal in the combined score.
pub const COSINE_WEIGHT: f64 = 0.7;

/// Weight of the chamfer signal in the combined score.
pub const CHAMFER_WEIGHT: f64 = 0.3;

/// Clamp a signal into `[0, 1]`. Non-finite values become `0`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted combination of the two signals, in `[0, 1]`.
pub fn raw_score(cosine: f64, chamfer: f64) -> f64 {
    clamp_unit(clamp_unit(cosine) * COSINE_WEIGHT + clamp_unit(chamfer) * CHAMFER_WEIGHT)
}

/// Score a (passage, query) pair from its raw similarity signals.
pub fn score(cosine: f64, chamfer: f64) -> RelevanceScore {
    RelevanceScore::from_raw(raw_score(cosine, chamfer))
}

/// Score a [`SimilarityPair`].
pub fn score_pair(pair: &SimilarityPair) -> RelevanceScore {
    score(pair.cosine, pair.chamfer)
}

// ---------------------------------------------------------------------------
// RelevanceScore / Tier
// ---------------------------------------------------------------------------

/// Integer relevance score in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelevanceScore(u8);

impl RelevanceScore {
    /// Highest possible score.
    pub const MAX: Self = Self(100);

    /// Build a score from an integer, saturating at 100.
    pub fn new(value: u8) -> Self {
        Self(value.min(100))
    }

    /// Convert an already-combined `[0, 1]` similarity into a score.
    pub fn from_raw(raw: f64) -> Self {
        let scaled = (clamp_unit(raw) * 100.0).round();
        Self(scaled.clamp(0.0, 100.0) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn tier(self) -> Tier {
        Tier::from_score(self)
    }
}

impl std::fmt::Display for RelevanceScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Discrete band of a [`RelevanceScore`]. Variants are ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Poor,
    Weak,
    Moderate,
    Good,
    Excellent,
}

impl Tier {
    pub fn from_score(score: RelevanceScore) -> Self {
        match score.value() {
            90..=u8::MAX => Self::Excellent,
            75..=89 => Self::Good,
            60..=74 => Self::Moderate,
            40..=59 => Self::Weak,
            _ => Self::Poor,
        }
    }

    /// `good` or `excellent`: the passage needs no optimization by default.
    pub fn is_optimal(self) -> bool {
        self >= Self::Good
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poor => "poor",
            Self::Weak => "weak",
            Self::Moderate => "moderate",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ScoreMatrix
// ---------------------------------------------------------------------------

/// Score of one passage against one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCell {
    pub query: String,
    /// Combined similarity in `[0, 1]`, as used by the resolver.
    pub raw: f64,
    pub score: RelevanceScore,
    pub tier: Tier,
}

/// All scored queries for one passage, in query order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub passage_index: usize,
    pub cells: Vec<ScoreCell>,
}

/// Scores for every (passage, query) pair the similarity provider supplied.
///
/// Rows follow passage order and cells follow query order. A pair with no
/// similarity data has no cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreMatrix {
    pub queries: Vec<String>,
    pub rows: Vec<ScoreRow>,
}

impl ScoreMatrix {
    /// Join passages, queries, and similarity pairs into a matrix.
    ///
    /// Unknown query texts and passage indices are ignored. When a pair is
    /// listed twice, the first entry wins.
    pub fn build(
        passages: &[Passage],
        queries: &[Query],
        similarities: &[PassageSimilarities],
    ) -> Self {
        let queries: Vec<String> = normalize_queries(queries)
            .into_iter()
            .map(|q| q.text)
            .collect();

        let mut by_passage: HashMap<usize, &PassageSimilarities> = HashMap::new();
        for entry in similarities {
            by_passage.entry(entry.passage_index).or_insert(entry);
        }

        let mut ignored = 0usize;
        for entry in similarities {
            if !passages.iter().any(|p| p.index == entry.passage_index) {
                ignored += entry.similarities.len();
                continue;
            }
            ignored += entry
                .similarities
                .iter()
                .filter(|s| !queries.contains(&s.query))
                .count();
        }

        let rows = passages
            .iter()
            .map(|passage| {
                let cells = match by_passage.get(&passage.index) {
                    Some(entry) => queries
                        .iter()
                        .filter_map(|query| {
                            entry
                                .similarities
                                .iter()
                                .find(|s| &s.query == query)
                                .map(|s| {
                                    let raw = raw_score(s.pair.cosine, s.pair.chamfer);
                                    let score = RelevanceScore::from_raw(raw);
                                    ScoreCell {
                                        query: query.clone(),
                                        raw,
                                        score,
                                        tier: score.tier(),
                                    }
                                })
                        })
                        .collect(),
                    None => Vec::new(),
                };
                ScoreRow {
                    passage_index: passage.index,
                    cells,
                }
            })
            .collect();

        if ignored > 0 {
            debug!(ignored, "ignored similarity entries with unknown passage or query");
        }

        Self { queries, rows }
    }

    pub fn row(&self, passage_index: usize) -> Option<&ScoreRow> {
        self.rows.iter().find(|r| r.passage_index == passage_index)
    }

    pub fn cell(&self, passage_index: usize, query: &str) -> Option<&ScoreCell> {
        self.row(passage_index)?
            .cells
            .iter()
            .find(|c| c.query == query)
    }

    /// Score for a pair, `0` when no similarity data exists.
    pub fn relevance(&self, passage_index: usize, query: &str) -> RelevanceScore {
        self.cell(passage_index, query)
            .map(|c| c.score)
            .unwrap_or_default()
    }

    /// Highest-scoring cell for a passage; ties go to the earlier query.
    pub fn best_for_passage(&self, passage_index: usize) -> Option<&ScoreCell> {
        self.row(passage_index)?
            .cells
            .iter()
            .fold(None, |best: Option<&ScoreCell>, cell| match best {
                Some(b) if b.raw >= cell.raw => Some(b),
                _ => Some(cell),
            })
    }

    /// Raw scores in the shape the assignment resolver consumes.
    pub fn to_passage_scores(&self) -> Vec<PassageScores> {
        self.rows
            .iter()
            .map(|row| PassageScores {
                passage_index: row.passage_index,
                scores: row
                    .cells
                    .iter()
                    .map(|c| QueryScore {
                        query: c.query.clone(),
                        score: c.raw,
                    })
                    .collect(),
            })
            .collect()
    }
}
