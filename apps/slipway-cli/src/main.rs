//! slipway CLI - release orchestration front-end.
//!
//! Entry point for the slipway release orchestrator. Initializes tracing,
//! parses CLI arguments, and dispatches to the appropriate command handler.

mod app;
mod cli;
mod exit_codes;

use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slipway=info".parse()?)
                .add_directive("slipway_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(cli.run().await);
}
