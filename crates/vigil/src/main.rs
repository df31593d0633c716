//! Vigil - distributed security-scanning pipeline.
//!
//! `serve` runs the orchestrator worker pool and the update supervisor in
//! one process. `lookup` and `update` are operational one-shots against the
//! same stores.

mod bootstrap;
mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use vigil_logging::LogConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Held for the life of the process; dropping it flushes the log worker
    let _log_guard = vigil_logging::init_logging(LogConfig {
        app_name: "vigil",
        verbose: cli.verbose,
    })?;

    match cli.command {
        Command::Serve(args) => bootstrap::serve(args).await,
        Command::Lookup(args) => bootstrap::lookup(args).await,
        Command::Update(args) => bootstrap::update(args).await,
        Command::Status(args) => bootstrap::status(args).await,
        Command::Enqueue(args) => bootstrap::enqueue(args).await,
    }
}
