//! Waymark CLI — corridor intelligence for migration checklists.
//!
//! Researches a migration corridor, synthesizes an ordered and
//! source-attributed checklist, and keeps it fresh over time.

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
