//! Diagnose why a passage underperforms for its assigned query.
//!
//! Every applicable heuristic runs and contributes an [`Issue`]; the single
//! most severe candidate failure mode becomes the passage's primary one.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use citelens_shared::Passage;

use crate::scoring::RelevanceScore;

/// Scores at or above this are considered optimized already.
pub const DIAGNOSIS_CEILING: u8 = 60;

/// Bodies shorter than this (in characters) lack detail.
const MIN_BODY_CHARS: usize = 200;

/// More pronouns than this and the passage stops standing on its own.
const MAX_PRONOUNS: usize = 3;

/// Missing query terms listed by name in the vocabulary issue.
const MAX_LISTED_TERMS: usize = 3;

static PRONOUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:this|that|it|they|these|those)\b").expect("valid regex")
});

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

static PROPER_NOUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl Issue {
    fn new(severity: IssueSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// Dominant reason a passage underperforms.
///
/// Variants are declared most severe first, so `Ord` follows precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    TopicMismatch,
    VocabularyGap,
    MissingSpecifics,
    StructureProblem,
    BuriedAnswer,
    NoDirectAnswer,
    AlreadyOptimized,
}

impl FailureMode {
    /// Point estimate of the score a fix can recover, before capping.
    fn improvement_estimate(self) -> u8 {
        match self {
            Self::TopicMismatch => 40,
            Self::VocabularyGap => 30,
            Self::MissingSpecifics => 20,
            Self::StructureProblem => 15,
            Self::BuriedAnswer => 10,
            Self::NoDirectAnswer => 5,
            Self::AlreadyOptimized => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopicMismatch => "topic_mismatch",
            Self::VocabularyGap => "vocabulary_gap",
            Self::MissingSpecifics => "missing_specifics",
            Self::StructureProblem => "structure_problem",
            Self::BuriedAnswer => "buried_answer",
            Self::NoDirectAnswer => "no_direct_answer",
            Self::AlreadyOptimized => "already_optimized",
        }
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixPriority {
    Critical,
    High,
    Medium,
    Low,
    None,
}

impl FixPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for FixPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a (passage, assigned query) pair scores the way it does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub issues: Vec<Issue>,
    pub primary_failure_mode: FailureMode,
    pub fix_priority: FixPriority,
    /// Estimated recoverable points; never more than `100 - score`.
    pub expected_improvement: u8,
}

impl Diagnosis {
    fn already_optimized() -> Self {
        Self {
            issues: Vec::new(),
            primary_failure_mode: FailureMode::AlreadyOptimized,
            fix_priority: FixPriority::None,
            expected_improvement: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Diagnose a passage against its assigned query (if any) at a given score.
pub fn diagnose(passage: &Passage, assigned_query: Option<&str>, score: RelevanceScore) -> Diagnosis {
    if score.value() >= DIAGNOSIS_CEILING {
        return Diagnosis::already_optimized();
    }

    let body = passage.body_text.as_str();
    let mut issues = Vec::new();
    let mut modes = Vec::new();

    if assigned_query.is_none() {
        issues.push(Issue::new(
            IssueSeverity::Error,
            "No query assigned: chunk may be off-topic or unoptimizable",
        ));
        modes.push(FailureMode::TopicMismatch);
    }

    let body_chars = body.chars().count();
    if body_chars < MIN_BODY_CHARS {
        issues.push(Issue::new(
            IssueSeverity::Warning,
            format!("Content is short ({body_chars} characters): insufficient detail to answer a query"),
        ));
    }

    if passage.heading_path.is_empty() {
        issues.push(Issue::new(
            IssueSeverity::Warning,
            "No heading: missing structural and semantic signal",
        ));
        modes.push(FailureMode::StructureProblem);
    }

    let pronouns = count_pronouns(body);
    if pronouns > MAX_PRONOUNS {
        issues.push(Issue::new(
            IssueSeverity::Warning,
            format!("High pronoun density ({pronouns}): passage is not self-contained"),
        ));
    }

    if let Some(query) = assigned_query {
        let missing = missing_terms(query, body);
        if !missing.is_empty() {
            let mut listed = missing
                .iter()
                .take(MAX_LISTED_TERMS)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if missing.len() > MAX_LISTED_TERMS {
                listed.push_str("...");
            }
            issues.push(Issue::new(
                IssueSeverity::Error,
                format!("Missing query terms: {listed}"),
            ));
            modes.push(FailureMode::VocabularyGap);
        }
    }

    if !has_specifics(body) {
        issues.push(Issue::new(
            IssueSeverity::Info,
            "No numbers or named entities: content may be too vague",
        ));
        modes.push(FailureMode::MissingSpecifics);
    }

    let primary_failure_mode = modes.into_iter().min().unwrap_or(FailureMode::NoDirectAnswer);
    let fix_priority = fix_priority(primary_failure_mode, &issues);
    let headroom = 100 - score.value();
    let expected_improvement = primary_failure_mode.improvement_estimate().min(headroom);

    debug!(
        passage = passage.index,
        issues = issues.len(),
        mode = %primary_failure_mode,
        priority = %fix_priority,
        "passage diagnosed"
    );

    Diagnosis {
        issues,
        primary_failure_mode,
        fix_priority,
        expected_improvement,
    }
}

fn fix_priority(primary: FailureMode, issues: &[Issue]) -> FixPriority {
    let has = |severity| issues.iter().any(|i| i.severity == severity);

    if matches!(primary, FailureMode::TopicMismatch | FailureMode::VocabularyGap) {
        FixPriority::Critical
    } else if has(IssueSeverity::Error) {
        FixPriority::High
    } else if has(IssueSeverity::Warning) {
        FixPriority::Medium
    } else {
        FixPriority::Low
    }
}

/// Whole-word, case-insensitive count of referential pronouns.
fn count_pronouns(body: &str) -> usize {
    PRONOUN_RE.find_iter(body).count()
}

/// Query words longer than three characters that the body never mentions.
fn missing_terms(query: &str, body: &str) -> Vec<String> {
    let body = body.to_lowercase();
    let mut missing: Vec<String> = Vec::new();

    for token in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 3)
        .map(str::to_lowercase)
    {
        if !body.contains(&token) && !missing.contains(&token) {
            missing.push(token);
        }
    }

    missing
}

fn has_specifics(body: &str) -> bool {
    DIGITS_RE.is_match(body) || PROPER_NOUN_RE.is_match(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(body: &str, heading_path: &[&str]) -> Passage {
        Passage {
            index: 0,
            heading_path: heading_path.iter().map(|h| (*h).to_string()).collect(),
            text: body.into(),
            body_text: body.into(),
            token_estimate: body.len() / 4,
        }
    }

    fn long_specific_body() -> String {
        format!(
            "Install Node.js 20 on Ubuntu Linux with the NodeSource repository. {}",
            "The installer adds the apt source and pins the release for you. ".repeat(3)
        )
    }

    #[test]
    fn scenario_c_vocabulary_gap_is_critical() {
        let p = passage("This topic is great. It really matters.", &[]);
        let d = diagnose(&p, Some("install nodejs on linux"), RelevanceScore::new(30));

        let vocab = d
            .issues
            .iter()
            .find(|i| i.message.starts_with("Missing query terms"))
            .expect("vocabulary issue");
        assert_eq!(vocab.severity, IssueSeverity::Error);
        assert!(vocab.message.contains("install"));
        assert!(vocab.message.contains("nodejs"));
        assert!(vocab.message.contains("linux"));
        assert!(!vocab.message.ends_with("..."));

        assert!(d.issues.iter().any(|i| i.severity == IssueSeverity::Warning
            && i.message.contains("short")));
        assert!(d.issues.iter().any(|i| i.severity == IssueSeverity::Warning
            && i.message.contains("heading")));
        assert!(!d.issues.iter().any(|i| i.message.contains("pronoun")));

        assert_eq!(d.primary_failure_mode, FailureMode::VocabularyGap);
        assert_eq!(d.fix_priority, FixPriority::Critical);
        assert_eq!(d.expected_improvement, 30);
    }

    #[test]
    fn scores_at_ceiling_are_already_optimized() {
        let p = passage("tiny", &[]);
        let d = diagnose(&p, None, RelevanceScore::new(60));
        assert_eq!(d.primary_failure_mode, FailureMode::AlreadyOptimized);
        assert_eq!(d.fix_priority, FixPriority::None);
        assert!(d.issues.is_empty());
        assert_eq!(d.expected_improvement, 0);
    }

    #[test]
    fn unassigned_passage_is_topic_mismatch() {
        let p = passage(&long_specific_body(), &["Guide"]);
        let d = diagnose(&p, None, RelevanceScore::new(20));
        assert_eq!(d.primary_failure_mode, FailureMode::TopicMismatch);
        assert_eq!(d.fix_priority, FixPriority::Critical);
        assert_eq!(d.issues[0].severity, IssueSeverity::Error);
        assert_eq!(d.expected_improvement, 40);
    }

    #[test]
    fn clean_passage_defaults_to_no_direct_answer() {
        let p = passage(&long_specific_body(), &["Guide", "Install"]);
        let d = diagnose(&p, Some("install ubuntu linux"), RelevanceScore::new(55));
        assert!(d.issues.is_empty(), "{:?}", d.issues);
        assert_eq!(d.primary_failure_mode, FailureMode::NoDirectAnswer);
        assert_eq!(d.fix_priority, FixPriority::Low);
        assert_eq!(d.expected_improvement, 5);
    }

    #[test]
    fn missing_heading_alone_is_structure_problem() {
        let p = passage(&long_specific_body(), &[]);
        let d = diagnose(&p, Some("install ubuntu"), RelevanceScore::new(50));
        assert_eq!(d.primary_failure_mode, FailureMode::StructureProblem);
        assert_eq!(d.fix_priority, FixPriority::Medium);
        assert_eq!(d.expected_improvement, 15);
    }

    #[test]
    fn vague_text_is_missing_specifics_with_low_priority() {
        let body = "a general overview of the approach and what you should consider when you pick one of the many available options for your own project and your own team and the way you like to work day to day over a long period";
        assert!(body.chars().count() >= 200);
        let p = passage(body, &["Overview"]);
        let d = diagnose(&p, Some("approach options"), RelevanceScore::new(45));
        assert_eq!(d.issues.len(), 1);
        assert_eq!(d.issues[0].severity, IssueSeverity::Info);
        assert_eq!(d.primary_failure_mode, FailureMode::MissingSpecifics);
        assert_eq!(d.fix_priority, FixPriority::Low);
    }

    #[test]
    fn pronoun_density_counts_whole_words_only() {
        assert_eq!(count_pronouns("This and that. It is theirs; THESE, those, they."), 6);
        assert_eq!(count_pronouns("thistle, item, thesis, athletic"), 0);

        let body = format!("{} This works. That works. It works. They work.", long_specific_body());
        let p = passage(&body, &["Guide"]);
        let d = diagnose(&p, Some("install"), RelevanceScore::new(50));
        assert!(d.issues.iter().any(|i| i.message.contains("pronoun density (4)")));
        assert_eq!(d.fix_priority, FixPriority::Medium);
    }

    #[test]
    fn more_than_three_missing_terms_are_truncated() {
        let p = passage(&long_specific_body(), &["Guide"]);
        let d = diagnose(&p, Some("docker kubernetes helm charts"), RelevanceScore::new(10));
        let vocab = d
            .issues
            .iter()
            .find(|i| i.message.starts_with("Missing query terms"))
            .unwrap();
        assert_eq!(vocab.message, "Missing query terms: docker, kubernetes, helm...");
    }

    #[test]
    fn missing_terms_use_case_insensitive_substrings() {
        let missing = missing_terms("Install NodeJS, on the LINUX box", "installing nodejs on linux");
        assert!(missing.is_empty(), "{missing:?}");
        assert_eq!(missing_terms("rust async", "RUST"), vec!["async".to_string()]);
    }

    #[test]
    fn improvement_never_exceeds_headroom() {
        let p = passage("x", &[]);
        for value in 0..DIAGNOSIS_CEILING {
            let d = diagnose(&p, None, RelevanceScore::new(value));
            assert!(d.expected_improvement <= 100 - value);
        }
    }

    #[test]
    fn improvement_grows_with_severity() {
        let ordered = [
            FailureMode::NoDirectAnswer,
            FailureMode::BuriedAnswer,
            FailureMode::StructureProblem,
            FailureMode::MissingSpecifics,
            FailureMode::VocabularyGap,
            FailureMode::TopicMismatch,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].improvement_estimate() < pair[1].improvement_estimate());
        }
    }

    #[test]
    fn diagnosis_serializes_snake_case() {
        let p = passage("This topic is great. It really matters.", &[]);
        let d = diagnose(&p, Some("install nodejs on linux"), RelevanceScore::new(30));
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains(r#""primary_failure_mode":"vocabulary_gap""#));
        assert!(json.contains(r#""fix_priority":"critical""#));
        assert!(json.contains(r#""severity":"warning""#));
    }
}
