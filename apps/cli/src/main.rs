//! boxoffice CLI: trigger surface for the revenue loader and metadata enrichment.
//!
//! Each subcommand runs one operation and exits; scheduling is left to cron
//! or an external orchestrator.

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
