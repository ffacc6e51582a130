//! papermonitor CLI: daily monitoring of preprint catalogs for relevant papers.
//!
//! Fetches recent papers from arXiv, bioRxiv and medRxiv, judges relevance
//! with keywords, an LLM or embeddings, and appends the hits to a file.

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
