//! Citelens CLI: relevance scoring and structural diagnosis for documents
//! that want to be cited by AI search.
//!
//! Reads an analysis input (passages, queries, similarity signals), assigns
//! each query its best passage, and explains what to fix.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
