//! Core domain types shared by the chunker, the engine, and the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CitelensError, Result};

/// Current schema version for the analysis input format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Passage
// ---------------------------------------------------------------------------

/// A contiguous, heading-scoped span of document text (a "chunk").
///
/// Produced upstream (see `citelens-markdown`) and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Zero-based position in the document.
    pub index: usize,
    /// Ancestor headings, outermost first. May be empty.
    #[serde(default)]
    pub heading_path: Vec<String>,
    /// Full content, including any heading echo.
    pub text: String,
    /// Content with the leading heading echo stripped.
    pub body_text: String,
    /// Approximate token count.
    #[serde(default)]
    pub token_estimate: usize,
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A target query the author wants the document to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// The query string. Also serves as the query's identity.
    pub text: String,
    /// Optional intent tag (e.g. `how_to`, `comparison`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_type: Option<String>,
    /// Whether this is the run's primary query.
    #[serde(default)]
    pub is_primary: bool,
}

impl Query {
    /// A non-primary query without an intent tag.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent_type: None,
            is_primary: false,
        }
    }

    /// The same query flagged as primary.
    pub fn primary(text: impl Into<String>) -> Self {
        Self {
            is_primary: true,
            ..Self::new(text)
        }
    }
}

// ---------------------------------------------------------------------------
// Similarity signals
// ---------------------------------------------------------------------------

/// Externally computed similarity signals for one (passage, query) pair.
///
/// Values are nominally in `[0, 1]`; the scorer clamps anything else.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimilarityPair {
    /// Direct semantic relevance.
    pub cosine: f64,
    /// Multi-aspect coverage.
    pub chamfer: f64,
}

/// Similarity of one passage against one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySimilarity {
    /// Query text; must match a [`Query::text`] or the entry is ignored.
    pub query: String,
    #[serde(flatten)]
    pub pair: SimilarityPair,
}

/// All similarity pairs for one passage, as an explicit ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageSimilarities {
    /// Passage index; must match a [`Passage::index`] or the entry is ignored.
    pub passage_index: usize,
    #[serde(default)]
    pub similarities: Vec<QuerySimilarity>,
}

// ---------------------------------------------------------------------------
// AnalysisInput
// ---------------------------------------------------------------------------

/// The on-disk input to a scoring run: the document, its passages, the
/// target queries, and the similarity provider's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisInput {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// The original document text.
    #[serde(default)]
    pub document_text: String,
    /// Passages in document order.
    pub passages: Vec<Passage>,
    /// Target queries in priority order.
    pub queries: Vec<Query>,
    /// Similarity pairs per passage.
    #[serde(default)]
    pub similarities: Vec<PassageSimilarities>,
}

impl AnalysisInput {
    /// Parse and version-check an input document.
    pub fn from_json(json: &str) -> Result<Self> {
        let input: Self = serde_json::from_str(json)
            .map_err(|e| CitelensError::parse(format!("invalid analysis input: {e}")))?;

        if input.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(CitelensError::validation(format!(
                "schema_version {} not supported (expected {CURRENT_SCHEMA_VERSION})",
                input.schema_version
            )));
        }

        Ok(input)
    }

    /// Read an input document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CitelensError::io(path, e))?;
        Self::from_json(&content)
    }
}
