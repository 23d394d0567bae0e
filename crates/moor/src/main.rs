//! moor CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use moor::cli::Cli;

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing. Diagnostics go to stderr; stdout carries only
    // mountpoint paths.
    let filter = EnvFilter::try_from_env("MOOR_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "moor={level},moor_store={level},moor_common={level}",
            level = cli.level.directive()
        ))
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Execute command
    cli.execute()
}
