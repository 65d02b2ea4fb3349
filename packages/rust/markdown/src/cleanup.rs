//! Pre-chunking cleanup pipeline for Markdown input.
//!
//! Each cleanup pass is a function `&str -> String` applied in sequence.
//! The pipeline removes frontmatter and stray HTML and normalizes blank
//! lines and whitespace so that section boundaries are unambiguous.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full cleanup pipeline on raw Markdown text.
pub(crate) fn run_pipeline(md: &str) -> String {
    let mut result = normalize_line_endings(md);

    result = strip_frontmatter(&result);
    result = strip_leftover_html(&result);
    result = normalize_whitespace(&result);
    result = collapse_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

/// Whether a line opens or closes a fenced code block.
pub(crate) fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

// ---------------------------------------------------------------------------
// Pass 1: Line endings
// ---------------------------------------------------------------------------

fn normalize_line_endings(md: &str) -> String {
    md.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// Pass 2: Frontmatter
// ---------------------------------------------------------------------------

/// Drop a leading YAML frontmatter block delimited by `---` lines.
///
/// An unterminated block is left in place.
fn strip_frontmatter(md: &str) -> String {
    let mut lines = md.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return md.to_string();
    }

    let mut consumed = 0usize;
    for line in lines {
        consumed += 1;
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            return md.lines().skip(consumed + 1).collect::<Vec<_>>().join("\n");
        }
    }

    md.to_string()
}

// ---------------------------------------------------------------------------
// Pass 3: Strip leftover HTML tags and comments
// ---------------------------------------------------------------------------

/// Remove HTML tags and single-line comments outside fenced code blocks,
/// preserving the text between tags.
fn strip_leftover_html(md: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut in_code_block = false;

    for line in md.lines() {
        if is_fence(line) {
            in_code_block = !in_code_block;
            lines.push(line.to_string());
            continue;
        }

        if in_code_block {
            lines.push(line.to_string());
            continue;
        }

        lines.push(strip_html_tags(line));
    }

    lines.join("\n")
}

/// Strip HTML tags from a single line, preserving inner text.
fn strip_html_tags(line: &str) -> String {
    static HTML_COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<!--.*?-->").expect("valid regex"));
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        // Tag names only; autolinks like <https://...> never match.
        Regex::new(r"</?[A-Za-z][A-Za-z0-9-]*(?:\s[^<>]*)?/?>").expect("valid regex")
    });

    let without_comments = HTML_COMMENT_RE.replace_all(line, "");
    HTML_TAG_RE.replace_all(&without_comments, "").to_string()
}

// ---------------------------------------------------------------------------
// Pass 4: Normalize whitespace
// ---------------------------------------------------------------------------

/// Trim trailing whitespace on every line.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 5: Collapse blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of blank lines into a single blank line.
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE
        .replace_all(md.trim_start_matches('\n'), "\n\n")
        .to_string()
}

// ---------------------------------------------------------------------------
// Pass 6: Ensure trailing newline
// ---------------------------------------------------------------------------

/// Ensure the text ends with exactly one newline.
fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_end_matches('\n');
    format!("{trimmed}\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
