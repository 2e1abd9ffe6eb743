//! CLI argument parsing.
//!
//! Defines the command-line interface for slipway using clap.
//! Two subcommands: `release` drives a release run, `status` renders the
//! persisted state read-only.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use slipway_core::{ReleaseOverrides, ReleaseType, ResetSelector};

use crate::app;

/// slipway - multi-package release orchestrator
#[derive(Parser)]
#[command(name = "slipway")]
#[command(author, version, about = "slipway - multi-package release orchestrator")]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Available slipway commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the release pipeline for a tag.
    Release {
        /// Release tag (e.g. "8.2.0", "8.2.0-rc1", "8.4-m01").
        tag: String,

        /// Path to the release configuration file.
        #[arg(long, default_value = "slipway.yaml")]
        config: PathBuf,

        /// Wipe state before starting: "all" or a package name.
        #[arg(long, value_name = "all|PACKAGE", value_parser = parse_reset_selector)]
        force_rebuild: Option<ResetSelector>,

        /// Only process these packages (repeatable).
        #[arg(long = "only-packages", value_name = "PACKAGE")]
        only_packages: Vec<String>,

        /// Override the tag-derived release type.
        #[arg(long, value_name = "rc|ga|maintenance|milestone",
              value_parser = parse_release_type)]
        force_release_type: Option<ReleaseType>,

        /// Record intents instead of calling real services.
        #[arg(long)]
        dry_run: bool,
    },

    /// Render the persisted release state without touching it.
    Status {
        /// Release tag to inspect.
        tag: String,

        /// Path to the release configuration file.
        #[arg(long, default_value = "slipway.yaml")]
        config: PathBuf,
    },
}

fn parse_reset_selector(s: &str) -> Result<ResetSelector, String> {
    s.parse()
}

fn parse_release_type(s: &str) -> Result<ReleaseType, String> {
    s.parse()
}

impl Cli {
    /// Executes the parsed CLI command, returning the process exit code.
    pub async fn run(self) -> i32 {
        match self.command {
            Commands::Release {
                tag,
                config,
                force_rebuild,
                only_packages,
                force_release_type,
                dry_run,
            } => {
                let overrides = ReleaseOverrides {
                    only_packages,
                    force_rebuild,
                    force_release_type,
                    dry_run,
                };
                app::run_release(&tag, &config, overrides).await
            }
            Commands::Status { tag, config } => app::show_status(&tag, &config).await,
        }
    }
}
