//! Document-wide structural analysis.
//!
//! Builds a [`ReasoningRequest`] from the document, its passages, and the
//! score matrix; sends it to a [`StructuralReasoningService`]; and validates
//! the response into an [`ArchitectureAnalysis`]. Individual malformed issues
//! are dropped. A response that is not an object with an `issues` array fails
//! the whole analysis.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use citelens_shared::{CitelensError, Passage, Query, Result};

use crate::assignment::normalize_queries;
use crate::reasoning::{
    ChunkQueryScore, ReasoningRequest, StructuralReasoningService, request_fingerprint,
    truncate_chars,
};
use crate::scoring::ScoreMatrix;

/// Document text beyond this many characters is cut before sending.
pub const MAX_DOCUMENT_CHARS: usize = 60_000;

// ---------------------------------------------------------------------------
// Issue types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    MisplacedContent,
    Redundancy,
    BrokenAtomicity,
    TopicIncoherence,
    CoverageGap,
    OrphanedMention,
}

impl IssueType {
    pub const ALL: [IssueType; 6] = [
        IssueType::MisplacedContent,
        IssueType::Redundancy,
        IssueType::BrokenAtomicity,
        IssueType::TopicIncoherence,
        IssueType::CoverageGap,
        IssueType::OrphanedMention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::MisplacedContent => "MISPLACED_CONTENT",
            IssueType::Redundancy => "REDUNDANCY",
            IssueType::BrokenAtomicity => "BROKEN_ATOMICITY",
            IssueType::TopicIncoherence => "TOPIC_INCOHERENCE",
            IssueType::CoverageGap => "COVERAGE_GAP",
            IssueType::OrphanedMention => "ORPHANED_MENTION",
        }
    }

    /// Case-insensitive parse of the wire name.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated structural issue. `chunk_indices` is non-empty, sorted, and
/// every entry refers to a passage that was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureIssue {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub chunk_indices: Vec<usize>,
    pub description: String,
    pub recommendation: String,
    pub impact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureSummary {
    pub total_issues: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub by_type: BTreeMap<IssueType, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureAnalysis {
    pub issues: Vec<ArchitectureIssue>,
    pub summary: ArchitectureSummary,
    /// Fingerprint of the request this analysis answers.
    pub request_fingerprint: String,
}

/// Borrowed view of everything a structural analysis needs.
#[derive(Debug, Clone, Copy)]
pub struct ArchitectureInput<'a> {
    pub document_text: &'a str,
    pub passages: &'a [Passage],
    pub queries: &'a [Query],
    pub scores: &'a ScoreMatrix,
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

/// Assemble the reasoning request. Every passage lists a score for every
/// query, in query order, with 0 where the matrix has no cell.
pub fn build_request(input: ArchitectureInput<'_>) -> ReasoningRequest {
    let queries: Vec<String> = normalize_queries(input.queries)
        .into_iter()
        .map(|q| q.text)
        .collect();

    let per_chunk_scores = input
        .passages
        .iter()
        .map(|p| {
            queries
                .iter()
                .map(|q| ChunkQueryScore {
                    query: q.clone(),
                    score: input.scores.relevance(p.index, q),
                })
                .collect()
        })
        .collect();

    ReasoningRequest {
        document_text: truncate_chars(input.document_text, MAX_DOCUMENT_CHARS).to_string(),
        chunk_bodies: input.passages.iter().map(|p| p.body_text.clone()).collect(),
        chunk_heading_paths: input
            .passages
            .iter()
            .map(|p| p.heading_path.clone())
            .collect(),
        queries,
        per_chunk_scores,
    }
}

// ---------------------------------------------------------------------------
// Response validation
// ---------------------------------------------------------------------------

/// Lenient wire shape of one issue. Validation into [`ArchitectureIssue`]
/// happens separately so that one bad issue never poisons the rest.
#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", alias = "issue_type")]
    issue_type: String,
    severity: String,
    #[serde(alias = "chunkIndices")]
    chunk_indices: Vec<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    recommendation: Option<String>,
    #[serde(default)]
    impact: Option<String>,
}

/// Strip a surrounding Markdown code fence, if any.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Validate a raw service response into issues.
///
/// # Errors
///
/// Returns [`CitelensError::Reasoning`] when the response is not a JSON
/// object with an `issues` array.
pub fn parse_response(raw: &str, passage_count: usize) -> Result<Vec<ArchitectureIssue>> {
    let body = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        CitelensError::Reasoning(format!(
            "response is not valid JSON: {e} (got: {})",
            truncate_chars(body, 200)
        ))
    })?;

    let entries = value
        .get("issues")
        .and_then(|issues| issues.as_array())
        .ok_or_else(|| CitelensError::Reasoning("response has no issues array".into()))?;

    let mut issues = Vec::with_capacity(entries.len());
    let mut seen_ids = HashSet::new();

    for (position, entry) in entries.iter().enumerate() {
        let raw_issue: RawIssue = match serde_json::from_value(entry.clone()) {
            Ok(issue) => issue,
            Err(e) => {
                warn!(position, error = %e, "dropping malformed issue");
                continue;
            }
        };

        let Some(issue) = validate_issue(raw_issue, position, passage_count) else {
            continue;
        };

        let issue = if issue.id.is_empty() || seen_ids.contains(&issue.id) {
            ArchitectureIssue {
                id: fallback_id(position, &seen_ids),
                ..issue
            }
        } else {
            issue
        };
        seen_ids.insert(issue.id.clone());
        issues.push(issue);
    }

    debug!(
        received = entries.len(),
        accepted = issues.len(),
        "validated structural issues"
    );
    Ok(issues)
}

/// `issue-{n}` starting at the 1-based position, skipping ids already taken.
fn fallback_id(position: usize, seen_ids: &HashSet<String>) -> String {
    (position + 1..)
        .map(|n| format!("issue-{n}"))
        .find(|id| !seen_ids.contains(id))
        .unwrap_or_default()
}

fn validate_issue(raw: RawIssue, position: usize, passage_count: usize) -> Option<ArchitectureIssue> {
    let Some(issue_type) = IssueType::parse(&raw.issue_type) else {
        warn!(position, issue_type = %raw.issue_type, "dropping issue with unknown type");
        return None;
    };
    let Some(severity) = Severity::parse(&raw.severity) else {
        warn!(position, severity = %raw.severity, "dropping issue with unknown severity");
        return None;
    };

    let mut indices = BTreeSet::new();
    for index in &raw.chunk_indices {
        match usize::try_from(*index) {
            Ok(i) if i < passage_count => {
                indices.insert(i);
            }
            _ => {
                warn!(position, index, passage_count, "dropping issue with out-of-range chunk index");
                return None;
            }
        }
    }
    if indices.is_empty() {
        warn!(position, "dropping issue with no chunk indices");
        return None;
    }

    // Empty ids get a fallback once the ids seen so far are known.
    let id = raw.id.map(|id| id.trim().to_string()).unwrap_or_default();

    Some(ArchitectureIssue {
        id,
        issue_type,
        severity,
        chunk_indices: indices.into_iter().collect(),
        description: raw.description.unwrap_or_default(),
        recommendation: raw.recommendation.unwrap_or_default(),
        impact: raw.impact.unwrap_or_default(),
    })
}

/// Count issues by severity and by type.
pub fn summarize(issues: &[ArchitectureIssue]) -> ArchitectureSummary {
    let mut summary = ArchitectureSummary {
        total_issues: issues.len(),
        ..ArchitectureSummary::default()
    };
    for issue in issues {
        match issue.severity {
            Severity::High => summary.high += 1,
            Severity::Medium => summary.medium += 1,
            Severity::Low => summary.low += 1,
        }
        *summary.by_type.entry(issue.issue_type).or_insert(0) += 1;
    }
    summary
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Run one structural analysis. All or nothing: any service or validation
/// failure is returned as an error and no partial analysis is produced.
#[instrument(skip_all, fields(passages = input.passages.len(), queries = input.queries.len()))]
pub async fn analyze<S>(service: &S, input: ArchitectureInput<'_>) -> Result<ArchitectureAnalysis>
where
    S: StructuralReasoningService,
{
    let request = build_request(input);
    let fingerprint = request_fingerprint(&request);

    let raw = service.analyze_structure(&request).await?;
    let issues = parse_response(&raw, input.passages.len())?;
    let summary = summarize(&issues);

    info!(
        issues = summary.total_issues,
        high = summary.high,
        medium = summary.medium,
        low = summary.low,
        "structural analysis complete"
    );

    Ok(ArchitectureAnalysis {
        issues,
        summary,
        request_fingerprint: fingerprint,
    })
}

// ---------------------------------------------------------------------------
// ArchitectureSession
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionState {
    epoch: u64,
    committed: Option<ArchitectureAnalysis>,
}

/// Serializes analyses for one document so that only the most recently
/// started analysis can become the committed result.
///
/// Starting a new analysis or calling [`cancel`](Self::cancel) bumps the
/// epoch; an in-flight analysis from an older epoch resolves to
/// [`CitelensError::Cancelled`] and never overwrites the committed result.
pub struct ArchitectureSession<S> {
    service: S,
    state: Mutex<SessionState>,
    epoch_tx: watch::Sender<u64>,
}

impl<S: StructuralReasoningService> ArchitectureSession<S> {
    pub fn new(service: S) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            service,
            state: Mutex::new(SessionState::default()),
            epoch_tx,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Start an analysis, superseding any in flight.
    pub async fn analyze(&self, input: ArchitectureInput<'_>) -> Result<ArchitectureAnalysis> {
        let epoch = self.bump_epoch().await;
        let mut epoch_rx = self.epoch_tx.subscribe();

        let outcome = tokio::select! {
            biased;
            _ = epoch_rx.wait_for(|current| *current != epoch) => {
                debug!(epoch, "structural analysis superseded");
                return Err(CitelensError::Cancelled(format!(
                    "structural analysis {epoch} superseded"
                )));
            }
            result = analyze(&self.service, input) => result,
        };

        // A failed analysis leaves the committed result untouched.
        let analysis = outcome?;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return Err(CitelensError::Cancelled(format!(
                "structural analysis {epoch} superseded"
            )));
        }
        state.committed = Some(analysis.clone());
        Ok(analysis)
    }

    /// Invalidate whatever analysis is in flight.
    pub async fn cancel(&self) {
        let epoch = self.bump_epoch().await;
        debug!(epoch, "structural analysis cancelled");
    }

    /// The most recent successfully committed analysis.
    pub async fn current(&self) -> Option<ArchitectureAnalysis> {
        self.state.lock().await.committed.clone()
    }

    async fn bump_epoch(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        self.epoch_tx.send_replace(state.epoch);
        state.epoch
    }
}
