//! Scoring, assignment, and diagnostic engine for Citelens.
//!
//! This crate turns externally computed similarity signals into relevance
//! scores, resolves a one-to-one query ↔ passage assignment, diagnoses weak
//! passages, and runs document-wide structural analysis through a reasoning
//! service (e.g., `analyze_run`, `architecture::analyze`).

pub mod architecture;
pub mod assignment;
pub mod batch;
pub mod diagnostics;
pub mod pipeline;
pub mod reasoning;
pub mod scoring;
pub mod tasks;

pub use architecture::{
    ArchitectureAnalysis, ArchitectureInput, ArchitectureIssue, ArchitectureSession,
    ArchitectureSummary, IssueType, Severity,
};
pub use assignment::{AssignmentMap, OptimizationTarget, QueryAssignment};
pub use batch::{AbortHandle, AbortSignal, BatchOutcome, BatchProgress, abort_pair, run_batch};
pub use diagnostics::{Diagnosis, FailureMode, FixPriority};
pub use pipeline::{OptimizationPlan, PlanWorker, RunOptions, RunReport, analyze_run};
pub use reasoning::{OpenRouterClient, ReasoningRequest, StructuralReasoningService};
pub use scoring::{RelevanceScore, ScoreMatrix, Tier};
pub use tasks::{ArchitectureTask, TaskType};
