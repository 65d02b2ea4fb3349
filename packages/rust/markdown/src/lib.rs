//! Markdown-to-passage chunking.
//!
//! Runs a series of cleanup passes, then splits the document into
//! heading-scoped sections. Each section becomes one [`Passage`] (or several,
//! when it is larger than the token budget) carrying its heading path.

mod cleanup;

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use citelens_shared::Passage;

/// Default per-passage token budget.
pub const DEFAULT_MAX_TOKENS: usize = 512;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6})[ \t]+(.+?)(?:[ \t]+#+)?[ \t]*$").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Options for [`chunk_markdown`].
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Sections estimated above this many tokens are split at paragraph
    /// boundaries.
    pub max_tokens: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// A heading-scoped run of lines before it is turned into passages.
struct Section<'a> {
    heading_line: Option<&'a str>,
    heading_path: Vec<String>,
    lines: Vec<&'a str>,
}

/// Split Markdown into passages.
///
/// 1. Cleanup passes (frontmatter, stray HTML, blank lines, whitespace)
/// 2. Split at ATX headings outside fenced code
/// 3. Drop empty sections
/// 4. Split oversized sections at paragraph boundaries
#[instrument(skip_all, fields(len = markdown.len(), max_tokens = opts.max_tokens))]
pub fn chunk_markdown(markdown: &str, opts: &ChunkOptions) -> Vec<Passage> {
    let cleaned = cleanup::run_pipeline(markdown);
    let sections = split_sections(&cleaned);
    let section_count = sections.len();

    let mut passages = Vec::new();
    for section in sections {
        let body = section.lines.join("\n").trim_matches('\n').to_string();
        if body.trim().is_empty() {
            continue;
        }

        for part in split_oversized(section.heading_line, &body, opts.max_tokens) {
            let text = match section.heading_line {
                Some(heading) => format!("{heading}\n\n{part}"),
                None => part.clone(),
            };
            passages.push(Passage {
                index: passages.len(),
                heading_path: section.heading_path.clone(),
                token_estimate: estimate_tokens(&text),
                text,
                body_text: part,
            });
        }
    }

    debug!(
        sections = section_count,
        passages = passages.len(),
        "chunking complete"
    );
    passages
}

/// Walk lines, opening a new section at every heading outside a fence.
fn split_sections(md: &str) -> Vec<Section<'_>> {
    let mut sections = vec![Section {
        heading_line: None,
        heading_path: Vec::new(),
        lines: Vec::new(),
    }];
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;

    for line in md.lines() {
        if cleanup::is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some(caps) = HEADING_RE.captures(line) {
                let level = caps[1].len();
                let title = caps[2].trim().to_string();

                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));

                sections.push(Section {
                    heading_line: Some(line.trim()),
                    heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
                    lines: Vec::new(),
                });
                continue;
            }
        }

        if let Some(current) = sections.last_mut() {
            current.lines.push(line);
        }
    }

    sections
}

/// Paragraphs separated by blank lines, never splitting inside a fence.
fn paragraphs(body: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in body.lines() {
        if cleanup::is_fence(line) {
            in_fence = !in_fence;
        }
        if line.trim().is_empty() && !in_fence {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

/// Greedily pack paragraphs into parts that fit the budget together with
/// the heading echo. A single paragraph over budget becomes its own part.
fn split_oversized(heading: Option<&str>, body: &str, max_tokens: usize) -> Vec<String> {
    let heading_chars = heading.map(|h| h.chars().count() + 2).unwrap_or(0);
    let fits = |text: &str| (heading_chars + text.chars().count()).div_ceil(4) <= max_tokens;

    if fits(body) {
        return vec![body.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for paragraph in paragraphs(body) {
        if current.is_empty() {
            current = paragraph;
            continue;
        }
        let candidate = format!("{current}\n\n{paragraph}");
        if fits(&candidate) {
            current = candidate;
        } else {
            parts.push(std::mem::replace(&mut current, paragraph));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}
