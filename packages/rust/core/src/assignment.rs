//! One-to-one query ↔ passage assignment.
//!
//! Each query claims at most one passage and each passage serves at most one
//! query. A match is valid only when its similarity reaches the threshold.
//! Resolution is greedy best-first over a totally ordered candidate list, so
//! identical inputs always produce identical maps.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use citelens_shared::{CitelensError, DEFAULT_ASSIGNMENT_THRESHOLD, Query, Result};

use crate::scoring::{RelevanceScore, Tier, clamp_unit};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Combined similarity of one passage against one query, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryScore {
    pub query: String,
    pub score: f64,
}

/// Every query score known for a passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageScores {
    pub passage_index: usize,
    pub scores: Vec<QueryScore>,
}

impl PassageScores {
    /// First score listed for `query`, clamped into `[0, 1]`.
    fn score_for(&self, query: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.query == query)
            .map(|s| clamp_unit(s.score))
    }
}

// ---------------------------------------------------------------------------
// AssignmentMap
// ---------------------------------------------------------------------------

/// Resolution outcome for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAssignment {
    pub query: String,
    /// `None` means the query is a content gap.
    pub assigned_passage_index: Option<usize>,
    /// Similarity of the winning pair, `0.0` when unassigned.
    pub score: f64,
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_type: Option<String>,
}

/// Resolution outcome for one passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassageAssignment {
    pub passage_index: usize,
    pub assigned_query: Option<String>,
}

/// Full result of query ↔ passage resolution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssignmentMap {
    /// One entry per distinct query, in query order.
    pub assignments: Vec<QueryAssignment>,
    /// One entry per passage, in passage order.
    pub passage_assignments: Vec<PassageAssignment>,
    /// Queries with no passage (content gaps), in query order.
    pub unassigned_queries: Vec<String>,
}

impl AssignmentMap {
    pub fn assignment(&self, query: &str) -> Option<&QueryAssignment> {
        self.assignments.iter().find(|a| a.query == query)
    }

    /// The query a passage serves, if any.
    pub fn query_for_passage(&self, passage_index: usize) -> Option<&str> {
        self.passage_assignments
            .iter()
            .find(|p| p.passage_index == passage_index)
            .and_then(|p| p.assigned_query.as_deref())
    }

    /// Verify both relations are injective, the two views agree, and every
    /// query is accounted for exactly once.
    pub fn check_invariants(&self) -> Result<()> {
        let mut queries = HashSet::new();
        let mut claimed = HashSet::new();
        for a in &self.assignments {
            if !queries.insert(a.query.as_str()) {
                return Err(CitelensError::validation(format!(
                    "query '{}' appears twice in assignments",
                    a.query
                )));
            }
            if let Some(p) = a.assigned_passage_index {
                if !claimed.insert(p) {
                    return Err(CitelensError::validation(format!(
                        "passage {p} is assigned to more than one query"
                    )));
                }
                if self.query_for_passage(p) != Some(a.query.as_str()) {
                    return Err(CitelensError::validation(format!(
                        "passage {p} does not record its assigned query '{}'",
                        a.query
                    )));
                }
            }
        }

        let mut passages = HashSet::new();
        for p in &self.passage_assignments {
            if !passages.insert(p.passage_index) {
                return Err(CitelensError::validation(format!(
                    "passage {} has two passage assignments",
                    p.passage_index
                )));
            }
            if let Some(q) = &p.assigned_query {
                let holds = self
                    .assignment(q)
                    .is_some_and(|a| a.assigned_passage_index == Some(p.passage_index));
                if !holds {
                    return Err(CitelensError::validation(format!(
                        "passage {} names query '{q}' which is not assigned to it",
                        p.passage_index
                    )));
                }
            }
        }

        let expected: Vec<&str> = self
            .assignments
            .iter()
            .filter(|a| a.assigned_passage_index.is_none())
            .map(|a| a.query.as_str())
            .collect();
        let actual: Vec<&str> = self.unassigned_queries.iter().map(String::as_str).collect();
        if expected != actual {
            return Err(CitelensError::validation(format!(
                "unassigned queries {actual:?} do not match gaps {expected:?}"
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Drop duplicate query texts (first wins) and keep at most one primary flag.
pub(crate) fn normalize_queries(queries: &[Query]) -> Vec<Query> {
    let mut seen = HashSet::new();
    let mut primary_seen = false;
    let mut out = Vec::with_capacity(queries.len());

    for query in queries {
        if !seen.insert(query.text.as_str()) {
            warn!(query = %query.text, "duplicate query ignored");
            continue;
        }
        let mut query = query.clone();
        if query.is_primary {
            if primary_seen {
                warn!(query = %query.text, "more than one primary query, flag ignored");
                query.is_primary = false;
            }
            primary_seen = true;
        }
        out.push(query);
    }

    out
}

fn effective_threshold(threshold: f64) -> f64 {
    if threshold.is_finite() {
        threshold.clamp(0.0, 1.0)
    } else {
        DEFAULT_ASSIGNMENT_THRESHOLD
    }
}

/// A potential (query, passage) match.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    query_order: usize,
    is_primary: bool,
    passage_index: usize,
    score: f64,
}

/// Best match first; ties go to the primary query, then query order, then
/// the lower passage index.
fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.is_primary.cmp(&a.is_primary))
        .then_with(|| a.query_order.cmp(&b.query_order))
        .then_with(|| a.passage_index.cmp(&b.passage_index))
}

/// Assign each query to at most one passage and each passage to at most one query.
#[instrument(skip_all, fields(passages = passages.len(), queries = queries.len(), threshold = threshold))]
pub fn resolve(passages: &[PassageScores], queries: &[Query], threshold: f64) -> AssignmentMap {
    let threshold = effective_threshold(threshold);
    let queries = normalize_queries(queries);

    let mut seen_passages = HashSet::new();
    let passages: Vec<&PassageScores> = passages
        .iter()
        .filter(|p| {
            let fresh = seen_passages.insert(p.passage_index);
            if !fresh {
                warn!(passage = p.passage_index, "duplicate passage index ignored");
            }
            fresh
        })
        .collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    for (query_order, query) in queries.iter().enumerate() {
        for passage in &passages {
            let Some(score) = passage.score_for(&query.text) else {
                continue;
            };
            if score >= threshold {
                candidates.push(Candidate {
                    query_order,
                    is_primary: query.is_primary,
                    passage_index: passage.passage_index,
                    score,
                });
            }
        }
    }
    candidates.sort_by(candidate_order);
    debug!(candidates = candidates.len(), "candidate matches above threshold");

    let mut winners: Vec<Option<(usize, f64)>> = vec![None; queries.len()];
    let mut claimed: HashSet<usize> = HashSet::new();
    for c in &candidates {
        if winners[c.query_order].is_some() || claimed.contains(&c.passage_index) {
            continue;
        }
        winners[c.query_order] = Some((c.passage_index, c.score));
        claimed.insert(c.passage_index);
    }

    let assignments: Vec<QueryAssignment> = queries
        .iter()
        .zip(winners)
        .map(|(query, winner)| QueryAssignment {
            query: query.text.clone(),
            assigned_passage_index: winner.map(|(p, _)| p),
            score: winner.map(|(_, s)| s).unwrap_or(0.0),
            is_primary: query.is_primary,
            intent_type: query.intent_type.clone(),
        })
        .collect();

    let passage_order: Vec<usize> = passages.iter().map(|p| p.passage_index).collect();
    let map = rebuild(assignments, &passage_order);

    debug_assert!(map.check_invariants().is_ok(), "resolver broke an invariant");
    info!(
        assigned = map.assignments.len() - map.unassigned_queries.len(),
        gaps = map.unassigned_queries.len(),
        "queries resolved"
    );

    map
}

/// Derive the passage view and the gap list from the query view.
fn rebuild(assignments: Vec<QueryAssignment>, passage_order: &[usize]) -> AssignmentMap {
    let passage_assignments = passage_order
        .iter()
        .map(|&passage_index| PassageAssignment {
            passage_index,
            assigned_query: assignments
                .iter()
                .find(|a| a.assigned_passage_index == Some(passage_index))
                .map(|a| a.query.clone()),
        })
        .collect();

    let unassigned_queries = assignments
        .iter()
        .filter(|a| a.assigned_passage_index.is_none())
        .map(|a| a.query.clone())
        .collect();

    AssignmentMap {
        assignments,
        passage_assignments,
        unassigned_queries,
    }
}

// ---------------------------------------------------------------------------
// Manual override
// ---------------------------------------------------------------------------

/// Point `query` at `target` (or clear it with `None`), bypassing the solver.
///
/// Any other query holding `target` loses it and becomes a gap. Unknown
/// queries and passages leave the map unchanged.
pub fn reassign(
    map: &AssignmentMap,
    scores: &[PassageScores],
    query: &str,
    target: Option<usize>,
) -> AssignmentMap {
    if map.assignment(query).is_none() {
        warn!(query, "reassign: unknown query ignored");
        return map.clone();
    }
    let known_target = target.is_none_or(|p| {
        map.passage_assignments
            .iter()
            .any(|pa| pa.passage_index == p)
    });
    if !known_target {
        warn!(query, passage = ?target, "reassign: unknown passage ignored");
        return map.clone();
    }

    let score = target
        .and_then(|p| scores.iter().find(|s| s.passage_index == p))
        .and_then(|s| s.score_for(query))
        .unwrap_or(0.0);

    let assignments = map
        .assignments
        .iter()
        .map(|a| {
            let mut a = a.clone();
            if a.query == query {
                a.assigned_passage_index = target;
                a.score = if target.is_some() { score } else { 0.0 };
            } else if target.is_some() && a.assigned_passage_index == target {
                debug!(evicted = %a.query, "reassign: passage taken over");
                a.assigned_passage_index = None;
                a.score = 0.0;
            }
            a
        })
        .collect();

    let passage_order: Vec<usize> = map
        .passage_assignments
        .iter()
        .map(|p| p.passage_index)
        .collect();
    let updated = rebuild(assignments, &passage_order);
    debug_assert!(updated.check_invariants().is_ok(), "reassign broke an invariant");
    updated
}

// ---------------------------------------------------------------------------
// Exclusion rule
// ---------------------------------------------------------------------------

/// Whether an assigned pair should go through optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationTarget {
    pub query: String,
    pub passage_index: usize,
    pub score: RelevanceScore,
    pub tier: Tier,
    /// Already in the `good`/`excellent` tier.
    pub already_optimal: bool,
    /// Selected for optimization: not already optimal, or force-included.
    pub included: bool,
}

/// Mark already-optimal passages as excluded unless force-included.
///
/// Advisory only: the assignment map is not changed.
pub fn optimization_targets(
    map: &AssignmentMap,
    force_include: &BTreeSet<usize>,
) -> Vec<OptimizationTarget> {
    map.assignments
        .iter()
        .filter_map(|a| {
            let passage_index = a.assigned_passage_index?;
            let score = RelevanceScore::from_raw(a.score);
            let tier = score.tier();
            let already_optimal = tier.is_optimal();
            Some(OptimizationTarget {
                query: a.query.clone(),
                passage_index,
                score,
                tier,
                already_optimal,
                included: !already_optimal || force_include.contains(&passage_index),
            })
        })
        .collect()
}
