pub mod targets;
pub mod unblock_all;
pub mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "readsieve")]
#[command(about = "Adaptive sampling (Read Until) for nanopore sequencers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a targeted sequencing experiment against a live run
    Targets(targets::TargetsArgs),
    /// Unblock every read; diagnostic latency test for playback runs
    UnblockAll(unblock_all::UnblockAllArgs),
    /// Load, validate, and describe an experiment configuration
    Validate(validate::ValidateArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Targets(args) => targets::run(args),
        Commands::UnblockAll(args) => unblock_all::run(args),
        Commands::Validate(args) => validate::run(args),
    }
}
