//! End-to-end scoring run: input → score matrix → assignment → diagnoses →
//! optimization targets, plus the per-query plan worker used by `optimize`.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use citelens_shared::{AnalysisInput, DEFAULT_ASSIGNMENT_THRESHOLD, Query, Result};

use crate::assignment::{self, AssignmentMap, OptimizationTarget};
use crate::batch::BatchWorker;
use crate::diagnostics::{self, Diagnosis};
use crate::scoring::{RelevanceScore, ScoreMatrix, Tier};

/// Configuration for [`analyze_run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Minimum combined similarity for a valid assignment.
    pub threshold: f64,
    /// Passages to optimize even when already in a good tier.
    pub force_include: BTreeSet<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ASSIGNMENT_THRESHOLD,
            force_include: BTreeSet::new(),
        }
    }
}

/// Per-passage view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageReport {
    pub passage_index: usize,
    pub heading_path: Vec<String>,
    pub assigned_query: Option<String>,
    /// Score against the assigned query, or the best score across all
    /// queries when unassigned. Unassigned passages are always diagnosed,
    /// whatever this score is.
    pub score: RelevanceScore,
    pub tier: Tier,
    pub diagnosis: Diagnosis,
}

/// Result of [`analyze_run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub matrix: ScoreMatrix,
    pub assignments: AssignmentMap,
    pub passages: Vec<PassageReport>,
    pub targets: Vec<OptimizationTarget>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunReport {
    /// Normalized queries in input order, as resolved by the run.
    pub fn queries(&self) -> Vec<Query> {
        self.assignments
            .assignments
            .iter()
            .map(|a| Query {
                text: a.query.clone(),
                intent_type: a.intent_type.clone(),
                is_primary: a.is_primary,
            })
            .collect()
    }
}

/// Score, assign, and diagnose every passage of an input.
#[instrument(skip_all, fields(passages = input.passages.len(), queries = input.queries.len()))]
pub fn analyze_run(input: &AnalysisInput, options: &RunOptions) -> RunReport {
    let start = Instant::now();

    let matrix = ScoreMatrix::build(&input.passages, &input.queries, &input.similarities);
    let assignments =
        assignment::resolve(&matrix.to_passage_scores(), &input.queries, options.threshold);

    let passages: Vec<PassageReport> = input
        .passages
        .iter()
        .map(|passage| {
            let assigned_query = assignments
                .query_for_passage(passage.index)
                .map(str::to_string);
            let (score, diagnosis) = match &assigned_query {
                Some(query) => {
                    let score = matrix.relevance(passage.index, query);
                    (score, diagnostics::diagnose(passage, Some(query.as_str()), score))
                }
                // No assigned query means no relevance to diagnose against.
                None => (
                    matrix
                        .best_for_passage(passage.index)
                        .map(|cell| cell.score)
                        .unwrap_or_default(),
                    diagnostics::diagnose(passage, None, RelevanceScore::default()),
                ),
            };
            PassageReport {
                passage_index: passage.index,
                heading_path: passage.heading_path.clone(),
                assigned_query,
                score,
                tier: score.tier(),
                diagnosis,
            }
        })
        .collect();

    let targets = assignment::optimization_targets(&assignments, &options.force_include);

    let report = RunReport {
        matrix,
        assignments,
        passages,
        targets,
        elapsed: start.elapsed(),
    };

    info!(
        assigned = report.targets.len(),
        gaps = report.assignments.unassigned_queries.len(),
        to_optimize = report.targets.iter().filter(|t| t.included).count(),
        elapsed_ms = report.elapsed.as_millis(),
        "run completed"
    );

    report
}

// ---------------------------------------------------------------------------
// Optimization plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Assigned and selected for optimization.
    Optimize,
    /// Assigned, already good, and not force-included.
    Skip,
    /// No passage reached the threshold for this query.
    Gap,
}

/// What to do about one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub query: String,
    pub status: PlanStatus,
    pub passage_index: Option<usize>,
    pub score: RelevanceScore,
    pub tier: Tier,
    pub diagnosis: Option<Diagnosis>,
}

/// Builds an [`OptimizationPlan`] per query from a finished run.
pub struct PlanWorker {
    targets: HashMap<String, OptimizationTarget>,
    diagnoses: HashMap<usize, Diagnosis>,
}

impl PlanWorker {
    pub fn new(report: &RunReport) -> Self {
        Self {
            targets: report
                .targets
                .iter()
                .map(|t| (t.query.clone(), t.clone()))
                .collect(),
            diagnoses: report
                .passages
                .iter()
                .map(|p| (p.passage_index, p.diagnosis.clone()))
                .collect(),
        }
    }

    /// The plan for one query; pure lookup over the run.
    pub fn plan(&self, query: &Query) -> OptimizationPlan {
        let Some(target) = self.targets.get(&query.text) else {
            return OptimizationPlan {
                query: query.text.clone(),
                status: PlanStatus::Gap,
                passage_index: None,
                score: RelevanceScore::default(),
                tier: Tier::Poor,
                diagnosis: None,
            };
        };

        OptimizationPlan {
            query: query.text.clone(),
            status: if target.included {
                PlanStatus::Optimize
            } else {
                PlanStatus::Skip
            },
            passage_index: Some(target.passage_index),
            score: target.score,
            tier: target.tier,
            diagnosis: self.diagnoses.get(&target.passage_index).cloned(),
        }
    }
}

impl BatchWorker<Query> for PlanWorker {
    type Output = OptimizationPlan;

    fn label(&self, item: &Query) -> String {
        item.text.clone()
    }

    async fn process(&self, item: Query) -> Result<OptimizationPlan> {
        Ok(self.plan(&item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::batch::{AbortSignal, SilentBatchProgress, run_batch};
    use crate::diagnostics::FailureMode;
    use citelens_shared::SimilarityPair;

    fn fixture() -> AnalysisInput {
        let json = std::fs::read_to_string("../../../fixtures/json/analysis.fixture.json")
            .expect("read fixture");
        AnalysisInput::from_json(&json).expect("parse fixture")
    }

    #[test]
    fn fixture_run_assigns_every_query() {
        let report = analyze_run(&fixture(), &RunOptions::default());
        report.assignments.check_invariants().unwrap();

        assert!(report.assignments.unassigned_queries.is_empty());
        let assigned: Vec<_> = report
            .assignments
            .assignments
            .iter()
            .map(|a| (a.query.as_str(), a.assigned_passage_index))
            .collect();
        assert_eq!(
            assigned,
            vec![
                ("install nodejs on linux", Some(1)),
                ("nodejs version manager", Some(0)),
                ("fix npm permission errors", Some(2)),
            ]
        );
    }

    #[test]
    fn fixture_run_reports_passages_and_targets() {
        let report = analyze_run(&fixture(), &RunOptions::default());

        let install = &report.passages[1];
        assert_eq!(install.score.value(), 90);
        assert_eq!(install.tier, Tier::Excellent);
        assert_eq!(install.diagnosis.primary_failure_mode, FailureMode::AlreadyOptimized);

        let intro = &report.passages[0];
        assert_eq!(intro.assigned_query.as_deref(), Some("nodejs version manager"));
        assert_eq!(intro.score.value(), 47);
        assert!(!intro.diagnosis.issues.is_empty());

        let install_target = report
            .targets
            .iter()
            .find(|t| t.passage_index == 1)
            .unwrap();
        assert!(install_target.already_optimal);
        assert!(!install_target.included);
    }

    #[test]
    fn force_include_overrides_exclusion() {
        let options = RunOptions {
            force_include: BTreeSet::from([1]),
            ..RunOptions::default()
        };
        let report = analyze_run(&fixture(), &options);
        assert!(report.targets.iter().all(|t| t.included));
    }

    #[test]
    fn high_threshold_leaves_gaps() {
        let options = RunOptions {
            threshold: 0.6,
            ..RunOptions::default()
        };
        let report = analyze_run(&fixture(), &options);
        assert_eq!(report.assignments.unassigned_queries.len(), 2);

        let worker = PlanWorker::new(&report);
        let gap = worker.plan(&Query::new("fix npm permission errors"));
        assert_eq!(gap.status, PlanStatus::Gap);
        assert_eq!(gap.passage_index, None);
    }

    #[test]
    fn unassigned_passage_is_diagnosed_despite_high_best_score() {
        let mut input = fixture();
        input.queries.truncate(1);
        let install = &mut input.similarities[0].similarities[0];
        assert_eq!(install.query, "install nodejs on linux");
        install.pair = SimilarityPair {
            cosine: 0.85,
            chamfer: 0.8,
        };

        let report = analyze_run(&input, &RunOptions::default());
        let intro = &report.passages[0];
        assert_eq!(intro.assigned_query, None);
        assert!(intro.score.value() >= 60);
        assert_eq!(intro.diagnosis.primary_failure_mode, FailureMode::TopicMismatch);
        assert!(!intro.diagnosis.issues.is_empty());

        assert_eq!(report.passages[1].assigned_query.as_deref(), Some("install nodejs on linux"));
    }

    #[test]
    fn run_is_deterministic() {
        let input = fixture();
        let a = analyze_run(&input, &RunOptions::default());
        let b = analyze_run(&input, &RunOptions::default());
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.passages, b.passages);
    }

    #[tokio::test]
    async fn plan_batch_covers_every_query() {
        let input = fixture();
        let report = analyze_run(&input, &RunOptions::default());
        let worker = Arc::new(PlanWorker::new(&report));

        assert_eq!(report.queries(), input.queries);
        let outcome = run_batch(
            report.queries(),
            worker,
            2,
            &SilentBatchProgress,
            AbortSignal::never(),
        )
        .await;

        let statuses: Vec<_> = outcome.completed().map(|p| (p.query.as_str(), p.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("install nodejs on linux", PlanStatus::Skip),
                ("nodejs version manager", PlanStatus::Optimize),
                ("fix npm permission errors", PlanStatus::Optimize),
            ]
        );
    }
}
