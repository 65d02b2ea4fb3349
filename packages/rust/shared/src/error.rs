//! Error types for Citelens.
//!
//! Library crates use [`CitelensError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Scoring, assignment, diagnosis and task generation are total and never
//! produce one of these; only I/O, configuration and the structural
//! reasoning boundary do.

use std::path::PathBuf;

/// Top-level error type for all Citelens operations.
#[derive(Debug, thiserror::Error)]
pub enum CitelensError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the reasoning service.
    #[error("network error: {0}")]
    Network(String),

    /// Input file or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Structural reasoning service failed or returned an unusable response.
    #[error("structural reasoning error: {0}")]
    Reasoning(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, broken invariant, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The operation was cancelled or superseded by a newer request.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CitelensError>;

impl CitelensError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Reasoning(_))
    }
}
