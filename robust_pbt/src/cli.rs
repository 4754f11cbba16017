//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Population-based training with subsequent adversarial attacks
#[derive(Parser)]
#[command(name = "robust-pbt-cli")]
#[command(about = "Train a PBT population, then attack the resulting seeds")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run PBT followed by the attack phase
    Run {
        /// Path to the run configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the base group label
        #[arg(short, long)]
        group: Option<String>,

        /// Use the in-process synthetic backend instead of spawning workers
        #[arg(long)]
        dry_run: bool,
    },
    /// Resolve and validate a configuration, then print it
    Validate {
        /// Path to the run configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}
