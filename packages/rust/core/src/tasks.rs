//! Turn structural issues into concrete, selectable edit tasks.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::architecture::{ArchitectureAnalysis, ArchitectureIssue, IssueType, Severity};

// A straight `'` only opens or closes a quote at a word boundary, so
// apostrophes inside words ("user's", "don't") are never quote marks.
static QUOTED_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\bheadings?\b[^"“”‘’\n]{0,40}?(?:["“‘]|[^\w']')([^"“”‘’\n]+?)(?:["”’]|'(?:[^\w]|$))"#,
    )
    .expect("valid regex")
});

// The colon must follow "heading" directly or through a short connective.
static COLON_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bheadings?\b(?:\s+(?:such\s+as|like|called|named|titled|reading|to|e\.g\.))?\s*:\s*([^\n.;]+)",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    MoveContent,
    RemoveRedundancy,
    ReplacePronoun,
    AddContext,
    SplitParagraph,
    AddHeading,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::MoveContent => "move_content",
            TaskType::RemoveRedundancy => "remove_redundancy",
            TaskType::ReplacePronoun => "replace_pronoun",
            TaskType::AddContext => "add_context",
            TaskType::SplitParagraph => "split_paragraph",
            TaskType::AddHeading => "add_heading",
        }
    }

    /// Task types generated for an issue type, in generation order.
    pub fn for_issue(issue_type: IssueType) -> &'static [TaskType] {
        match issue_type {
            IssueType::MisplacedContent => &[TaskType::MoveContent],
            IssueType::Redundancy => &[TaskType::RemoveRedundancy],
            IssueType::BrokenAtomicity => &[TaskType::ReplacePronoun, TaskType::AddContext],
            IssueType::TopicIncoherence => &[TaskType::SplitParagraph, TaskType::AddHeading],
            IssueType::CoverageGap => &[TaskType::AddContext],
            IssueType::OrphanedMention => &[TaskType::AddContext],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLocation {
    pub chunk_index: usize,
    /// Set when the source issue spans several chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_heading: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureTask {
    /// `task-{issue}-{mapping}`; stable for a given analysis.
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub issue_id: String,
    pub description: String,
    pub location: TaskLocation,
    pub priority: Severity,
    pub expected_impact: String,
    pub is_selected: bool,
    #[serde(default)]
    pub details: TaskDetails,
}

/// Expand every issue into its mapped tasks.
///
/// High-severity tasks start selected. Generation is a pure function of the
/// analysis, so calling it twice yields identical tasks.
pub fn generate(analysis: &ArchitectureAnalysis) -> Vec<ArchitectureTask> {
    analysis
        .issues
        .iter()
        .enumerate()
        .flat_map(|(issue_index, issue)| {
            TaskType::for_issue(issue.issue_type)
                .iter()
                .enumerate()
                .map(move |(mapping_index, task_type)| {
                    build_task(issue_index, mapping_index, *task_type, issue)
                })
        })
        .collect()
}

fn build_task(
    issue_index: usize,
    mapping_index: usize,
    task_type: TaskType,
    issue: &ArchitectureIssue,
) -> ArchitectureTask {
    // Validated issues always carry at least one index.
    let chunk_index = issue.chunk_indices.first().copied().unwrap_or_default();
    let position = (issue.chunk_indices.len() > 1).then(|| {
        let list: Vec<String> = issue.chunk_indices.iter().map(|i| i.to_string()).collect();
        format!("spans chunks {}", list.join(", "))
    });

    let suggested_heading = match task_type {
        TaskType::AddHeading => extract_heading(&issue.recommendation),
        _ => None,
    };

    let expected_impact = if issue.impact.trim().is_empty() {
        format!("{} impact", issue.severity)
    } else {
        issue.impact.clone()
    };

    ArchitectureTask {
        id: format!("task-{issue_index}-{mapping_index}"),
        task_type,
        issue_id: issue.id.clone(),
        description: describe(task_type, chunk_index, issue),
        location: TaskLocation {
            chunk_index,
            position,
        },
        priority: issue.severity,
        expected_impact,
        is_selected: issue.severity == Severity::High,
        details: TaskDetails { suggested_heading },
    }
}

fn describe(task_type: TaskType, chunk_index: usize, issue: &ArchitectureIssue) -> String {
    let action = match task_type {
        TaskType::MoveContent => format!("Move misplaced content out of chunk {chunk_index}"),
        TaskType::RemoveRedundancy => format!("Remove content repeated in chunk {chunk_index}"),
        TaskType::ReplacePronoun => {
            format!("Replace pronouns in chunk {chunk_index} with the nouns they refer to")
        }
        TaskType::AddContext => format!("Add missing context to chunk {chunk_index}"),
        TaskType::SplitParagraph => format!("Split chunk {chunk_index} into single-topic sections"),
        TaskType::AddHeading => format!("Add a descriptive heading to chunk {chunk_index}"),
    };

    let detail = if issue.recommendation.trim().is_empty() {
        issue.description.trim()
    } else {
        issue.recommendation.trim()
    };

    if detail.is_empty() {
        action
    } else {
        format!("{action}: {detail}")
    }
}

/// Pull a proposed heading out of free-text advice.
///
/// Looks for a quoted phrase following the word "heading", then for a phrase
/// after a colon. Returns `None` when neither is present.
pub fn extract_heading(recommendation: &str) -> Option<String> {
    let captured = QUOTED_HEADING_RE
        .captures(recommendation)
        .or_else(|| COLON_HEADING_RE.captures(recommendation))?;

    let heading = captured
        .get(1)?
        .as_str()
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '`'))
        .trim();

    (!heading.is_empty()).then(|| heading.to_string())
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Copy of `tasks` with the named task's selection set. Unknown IDs leave
/// the list unchanged.
pub fn set_selected(tasks: &[ArchitectureTask], id: &str, selected: bool) -> Vec<ArchitectureTask> {
    tasks
        .iter()
        .map(|task| {
            let mut task = task.clone();
            if task.id == id {
                task.is_selected = selected;
            }
            task
        })
        .collect()
}

pub fn toggle_selected(tasks: &[ArchitectureTask], id: &str) -> Vec<ArchitectureTask> {
    match tasks.iter().find(|t| t.id == id) {
        Some(task) => set_selected(tasks, id, !task.is_selected),
        None => tasks.to_vec(),
    }
}

/// Tasks currently selected, in generation order.
pub fn selected(tasks: &[ArchitectureTask]) -> Vec<&ArchitectureTask> {
    tasks.iter().filter(|t| t.is_selected).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::summarize;

    fn issue(id: &str, issue_type: IssueType, severity: Severity, chunks: &[usize]) -> ArchitectureIssue {
        ArchitectureIssue {
            id: id.into(),
            issue_type,
            severity,
            chunk_indices: chunks.to_vec(),
            description: "desc".into(),
            recommendation: String::new(),
            impact: "Better retrieval".into(),
        }
    }

    fn analysis(issues: Vec<ArchitectureIssue>) -> ArchitectureAnalysis {
        ArchitectureAnalysis {
            summary: summarize(&issues),
            issues,
            request_fingerprint: "fp".into(),
        }
    }

    #[test]
    fn redundancy_medium_yields_one_unselected_task() {
        let tasks = generate(&analysis(vec![issue(
            "r1",
            IssueType::Redundancy,
            Severity::Medium,
            &[3, 7],
        )]));

        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.id, "task-0-0");
        assert_eq!(task.task_type, TaskType::RemoveRedundancy);
        assert_eq!(task.issue_id, "r1");
        assert_eq!(task.location.chunk_index, 3);
        assert_eq!(task.location.position.as_deref(), Some("spans chunks 3, 7"));
        assert_eq!(task.priority, Severity::Medium);
        assert!(!task.is_selected);
    }

    #[test]
    fn mapping_covers_every_issue_type() {
        let issues: Vec<_> = IssueType::ALL
            .iter()
            .enumerate()
            .map(|(i, t)| issue(&format!("i{i}"), *t, Severity::High, &[i]))
            .collect();
        let tasks = generate(&analysis(issues));

        let kinds: Vec<_> = tasks.iter().map(|t| (t.id.as_str(), t.task_type)).collect();
        assert_eq!(
            kinds,
            vec![
                ("task-0-0", TaskType::MoveContent),
                ("task-1-0", TaskType::RemoveRedundancy),
                ("task-2-0", TaskType::ReplacePronoun),
                ("task-2-1", TaskType::AddContext),
                ("task-3-0", TaskType::SplitParagraph),
                ("task-3-1", TaskType::AddHeading),
                ("task-4-0", TaskType::AddContext),
                ("task-5-0", TaskType::AddContext),
            ]
        );
        assert!(tasks.iter().all(|t| t.is_selected));
        assert!(tasks.iter().all(|t| t.location.position.is_none()));
    }

    #[test]
    fn generation_is_idempotent() {
        let a = analysis(vec![
            issue("a", IssueType::BrokenAtomicity, Severity::Low, &[0]),
            issue("b", IssueType::TopicIncoherence, Severity::High, &[1, 2]),
        ]);
        assert_eq!(generate(&a), generate(&a));
    }

    #[test]
    fn add_heading_task_carries_suggestion() {
        let mut incoherent = issue("t", IssueType::TopicIncoherence, Severity::Medium, &[1]);
        incoherent.recommendation =
            r#"Split the section and add a heading such as "Configuring npm" above the second half."#
                .into();
        let tasks = generate(&analysis(vec![incoherent]));

        assert_eq!(tasks[0].details.suggested_heading, None);
        assert_eq!(
            tasks[1].details.suggested_heading.as_deref(),
            Some("Configuring npm")
        );
        assert!(tasks[1].description.starts_with("Add a descriptive heading to chunk 1: Split"));
    }

    #[test]
    fn heading_extraction_variants() {
        assert_eq!(
            extract_heading("Add heading: Installing on Linux. Then move steps."),
            Some("Installing on Linux".into())
        );
        assert_eq!(
            extract_heading("Use a subheading 'Troubleshooting'"),
            None,
            "subheading is a different word"
        );
        assert_eq!(
            extract_heading("Insert new headings “Setup” and “Usage”"),
            Some("Setup".into())
        );
        assert_eq!(extract_heading("Split into two sections."), None);
        assert_eq!(extract_heading("Add a heading"), None);
        assert_eq!(
            extract_heading("Add heading 'Don't Panic' before the FAQ"),
            Some("Don't Panic".into())
        );
    }

    #[test]
    fn apostrophes_are_not_quotes() {
        assert_eq!(extract_heading("Add a heading for the user's setup steps."), None);
        assert_eq!(
            extract_heading("Add a heading for the user's setup steps, and a 'Setup' label"),
            Some("Setup".into())
        );
        assert_eq!(
            extract_heading("Give the author's notes a heading ‘Background’"),
            Some("Background".into())
        );
    }

    #[test]
    fn colon_must_follow_heading() {
        assert_eq!(extract_heading("The heading structure is weak: split it"), None);
        assert_eq!(
            extract_heading("Add a heading titled: Configuring npm"),
            Some("Configuring npm".into())
        );
    }

    #[test]
    fn empty_impact_falls_back_to_severity() {
        let mut gap = issue("g", IssueType::CoverageGap, Severity::Low, &[0]);
        gap.impact = "  ".into();
        let tasks = generate(&analysis(vec![gap]));
        assert_eq!(tasks[0].expected_impact, "low impact");
    }

    #[test]
    fn selection_helpers_return_new_lists() {
        let tasks = generate(&analysis(vec![
            issue("a", IssueType::Redundancy, Severity::High, &[0]),
            issue("b", IssueType::CoverageGap, Severity::Low, &[1]),
        ]));

        let toggled = toggle_selected(&tasks, "task-1-0");
        assert!(!tasks[1].is_selected);
        assert!(toggled[1].is_selected);
        assert_eq!(selected(&toggled).len(), 2);

        let cleared = set_selected(&toggled, "task-0-0", false);
        let ids: Vec<_> = selected(&cleared).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task-1-0"]);

        assert_eq!(toggle_selected(&tasks, "missing"), tasks);
    }

    #[test]
    fn task_serializes_wire_names() {
        let tasks = generate(&analysis(vec![issue(
            "a",
            IssueType::MisplacedContent,
            Severity::High,
            &[0],
        )]));
        let json = serde_json::to_string(&tasks[0]).unwrap();
        assert!(json.contains(r#""type":"move_content""#));
        assert!(json.contains(r#""priority":"high""#));
        assert!(!json.contains("position"));
    }
}
