//! Shared types, error model, and configuration for Citelens.
//!
//! This crate is the foundation depended on by all other Citelens crates.
//! It provides:
//! - [`CitelensError`]: the unified error type
//! - Domain types ([`Passage`], [`Query`], [`SimilarityPair`], [`AnalysisInput`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_ASSIGNMENT_THRESHOLD, DefaultsConfig, OpenRouterConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{CitelensError, Result};
pub use types::{
    AnalysisInput, CURRENT_SCHEMA_VERSION, Passage, PassageSimilarities, Query, QuerySimilarity,
    SimilarityPair,
};
