//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use citelens_core::architecture::{ArchitectureInput, ArchitectureSession};
use citelens_core::batch::{
    BatchOutcome, BatchPhase, BatchProgress, BatchProgressReporter, ItemOutcome, abort_pair,
    run_batch,
};
use citelens_core::pipeline::{OptimizationPlan, PlanStatus, PlanWorker, RunOptions, analyze_run};
use citelens_core::reasoning::OpenRouterClient;
use citelens_core::tasks;
use citelens_markdown::{ChunkOptions, chunk_markdown};
use citelens_shared::{
    AnalysisInput, AppConfig, CitelensError, init_config, load_config, validate_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Citelens: find out which passage answers which query, and why it falls short.
#[derive(Parser)]
#[command(
    name = "citelens",
    version,
    about = "Score passages against target queries, assign each query its best passage, and diagnose weak spots.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Split a Markdown file into passages and print them as JSON.
    Chunk {
        /// Markdown file to chunk.
        file: PathBuf,

        /// Token budget per passage (defaults to config).
        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Score passages, resolve assignments, and diagnose every passage.
    Score {
        /// Analysis input JSON file.
        #[arg(short, long)]
        input: PathBuf,

        /// Minimum combined similarity for an assignment (defaults to config).
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Passage indices to optimize even when already good (comma-separated).
        #[arg(long, value_delimiter = ',')]
        force_include: Vec<usize>,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build an optimization plan for every query.
    Optimize {
        /// Analysis input JSON file.
        #[arg(short, long)]
        input: PathBuf,

        /// Queries processed concurrently (defaults to config).
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Minimum combined similarity for an assignment (defaults to config).
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Passage indices to optimize even when already good (comma-separated).
        #[arg(long, value_delimiter = ',')]
        force_include: Vec<usize>,

        /// Print plans as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run document-wide structural analysis and generate edit tasks.
    Architecture {
        /// Analysis input JSON file.
        #[arg(short, long)]
        input: PathBuf,

        /// OpenRouter model ID (defaults to config).
        #[arg(short, long)]
        model: Option<String>,

        /// Print analysis and tasks as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "citelens=info",
        1 => "citelens=debug",
        _ => "citelens=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so JSON output on stdout stays clean.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Chunk { file, max_tokens } => cmd_chunk(&file, max_tokens),
        Command::Score {
            input,
            threshold,
            force_include,
            json,
        } => cmd_score(&input, threshold, &force_include, json),
        Command::Optimize {
            input,
            concurrency,
            threshold,
            force_include,
            json,
        } => cmd_optimize(&input, concurrency, threshold, &force_include, json).await,
        Command::Architecture { input, model, json } => {
            cmd_architecture(&input, model.as_deref(), json).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// Resolve run options: CLI flags override the config file.
fn run_options(config: &AppConfig, threshold: Option<f64>, force_include: &[usize]) -> RunOptions {
    RunOptions {
        threshold: threshold.unwrap_or(config.defaults.assignment_threshold),
        force_include: force_include.iter().copied().collect::<BTreeSet<_>>(),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_chunk(file: &Path, max_tokens: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let markdown =
        std::fs::read_to_string(file).map_err(|e| CitelensError::io(file, e))?;

    let opts = ChunkOptions {
        max_tokens: max_tokens.unwrap_or(config.defaults.max_chunk_tokens),
    };
    let passages = chunk_markdown(&markdown, &opts);

    info!(file = %file.display(), passages = passages.len(), "chunked document");
    println!("{}", serde_json::to_string_pretty(&passages)?);
    Ok(())
}

fn cmd_score(input: &Path, threshold: Option<f64>, force_include: &[usize], json: bool) -> Result<()> {
    let config = load_config()?;
    let analysis = AnalysisInput::load(input)?;
    let report = analyze_run(&analysis, &run_options(&config, threshold, force_include));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  {:<5} {:<36} {:<30} {:>5}  {:<9} Failure mode", "#", "Heading", "Query", "Score", "Tier");
    for passage in &report.passages {
        let heading = if passage.heading_path.is_empty() {
            "(preamble)".to_string()
        } else {
            passage.heading_path.join(" > ")
        };
        println!(
            "  {:<5} {:<36} {:<30} {:>5}  {:<9} {}",
            passage.passage_index,
            truncate(&heading, 36),
            truncate(passage.assigned_query.as_deref().unwrap_or("-"), 30),
            passage.score,
            passage.tier,
            passage.diagnosis.primary_failure_mode.as_str(),
        );
    }

    if !report.assignments.unassigned_queries.is_empty() {
        println!();
        println!("  Content gaps (no passage reached the threshold):");
        for query in &report.assignments.unassigned_queries {
            println!("    - {query}");
        }
    }

    let excluded: Vec<_> = report.targets.iter().filter(|t| !t.included).collect();
    if !excluded.is_empty() {
        println!();
        println!("  Already optimal (use --force-include to optimize anyway):");
        for target in excluded {
            println!("    - passage {} ({}, {})", target.passage_index, target.score, target.tier);
        }
    }
    println!();

    Ok(())
}

async fn cmd_optimize(
    input: &Path,
    concurrency: Option<usize>,
    threshold: Option<f64>,
    force_include: &[usize],
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    let analysis = AnalysisInput::load(input)?;
    let report = analyze_run(&analysis, &run_options(&config, threshold, force_include));

    let queries = report.queries();
    let concurrency = concurrency.unwrap_or(config.defaults.batch_concurrency as usize);
    let worker = Arc::new(PlanWorker::new(&report));

    let (abort, signal) = abort_pair();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight queries are discarded");
            abort.abort();
        }
    });

    let reporter = CliBatchProgress::new(queries.len());
    let outcome = run_batch(queries, worker, concurrency, &reporter, signal).await;
    ctrl_c.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_plans(&outcome);
    }

    if outcome.aborted {
        return Err(eyre!(
            "optimization aborted: {} of {} queries discarded",
            outcome.discarded_count(),
            outcome.results.len()
        ));
    }
    Ok(())
}

fn print_plans(outcome: &BatchOutcome<OptimizationPlan>) {
    println!();
    for result in &outcome.results {
        match &result.outcome {
            ItemOutcome::Completed(plan) => {
                let action = match plan.status {
                    PlanStatus::Optimize => "optimize",
                    PlanStatus::Skip => "skip",
                    PlanStatus::Gap => "gap",
                };
                let location = plan
                    .passage_index
                    .map(|i| format!("passage {i}"))
                    .unwrap_or_else(|| "no passage".into());
                println!("  [{action}] {} -> {location} ({}, {})", plan.query, plan.score, plan.tier);
                if let Some(diagnosis) = &plan.diagnosis {
                    for issue in &diagnosis.issues {
                        println!("      - {}", issue.message);
                    }
                    if diagnosis.expected_improvement > 0 {
                        println!(
                            "      expected improvement: +{} ({} priority)",
                            diagnosis.expected_improvement, diagnosis.fix_priority
                        );
                    }
                }
            }
            ItemOutcome::Failed(error) => println!("  [failed] {}: {error}", result.label),
            ItemOutcome::Discarded => println!("  [discarded] {}", result.label),
        }
    }
    println!();
}

async fn cmd_architecture(input: &Path, model: Option<&str>, json: bool) -> Result<()> {
    let config = load_config()?;
    let api_key = validate_api_key(&config)?;
    let analysis_input = AnalysisInput::load(input)?;
    let report = analyze_run(&analysis_input, &run_options(&config, None, &[]));

    let mut client = OpenRouterClient::new(&config.openrouter, api_key)?;
    if let Some(model) = model {
        client = client.with_model(model);
    }
    info!(model = client.model(), "starting structural analysis");

    let session = ArchitectureSession::new(client);
    let arch_input = ArchitectureInput {
        document_text: &analysis_input.document_text,
        passages: &analysis_input.passages,
        queries: &analysis_input.queries,
        scores: &report.matrix,
    };

    let spinner = spinner("Analyzing document structure");
    let result = tokio::select! {
        result = session.analyze(arch_input) => result,
        _ = tokio::signal::ctrl_c() => {
            session.cancel().await;
            spinner.finish_and_clear();
            return Err(eyre!("structural analysis cancelled"));
        }
    };
    spinner.finish_and_clear();

    let analysis = result?;
    let tasks = tasks::generate(&analysis);

    if json {
        let output = serde_json::json!({ "analysis": analysis, "tasks": tasks });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let summary = &analysis.summary;
    println!();
    println!(
        "  {} issues ({} high, {} medium, {} low)",
        summary.total_issues, summary.high, summary.medium, summary.low
    );
    for issue in &analysis.issues {
        let chunks: Vec<String> = issue.chunk_indices.iter().map(|i| i.to_string()).collect();
        println!(
            "  [{}] {} in chunks {}: {}",
            issue.severity,
            issue.issue_type,
            chunks.join(", "),
            issue.description
        );
    }

    if !tasks.is_empty() {
        println!();
        println!("  Tasks (* = selected):");
        for task in &tasks {
            let mark = if task.is_selected { "*" } else { " " };
            println!("  {mark} {} {}", task.id, task.description);
            if let Some(heading) = &task.details.suggested_heading {
                println!("        suggested heading: {heading}");
            }
        }
    }
    println!();

    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporting
// ---------------------------------------------------------------------------

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}

/// Batch progress reporter using an indicatif bar.
struct CliBatchProgress {
    bar: ProgressBar,
}

impl CliBatchProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}") {
            bar.set_style(style);
        }
        Self { bar }
    }
}

impl BatchProgressReporter for CliBatchProgress {
    fn on_progress(&self, progress: &BatchProgress) {
        self.bar.set_length(progress.total as u64);
        self.bar.set_position(progress.completed as u64);
        if let Some(query) = &progress.current_query {
            self.bar.set_message(query.clone());
        }
        if matches!(progress.phase, BatchPhase::Complete | BatchPhase::Aborted) {
            self.bar.finish_and_clear();
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
