//! CLI command that loads, validates, and describes a configuration.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::{error, info};

use crate::cli::targets::init_plugins;
use crate::config::Conf;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Experiment configuration TOML to validate
    pub toml: PathBuf,
    /// Channel count to validate the region split against
    #[arg(long, default_value = "512")]
    pub channels: u32,
    /// Skip constructing and validating the plugins
    #[arg(long)]
    pub no_check_plugins: bool,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    let conf = match Conf::from_file(&args.toml, args.channels) {
        Ok(conf) => conf,
        Err(e) => {
            error!("could not load {}:\n{e}", args.toml.display());
            anyhow::bail!("configuration is invalid");
        }
    };
    info!("loaded {} without error", args.toml.display());
    info!("{}", conf.describe());

    if args.no_check_plugins {
        info!("plugin initialisation was skipped");
        return Ok(());
    }
    match init_plugins(&conf) {
        Ok((mut caller, mut aligner)) => {
            caller.disconnect();
            aligner.disconnect();
            info!("caller and aligner initialised without error");
            Ok(())
        }
        Err(e) => {
            error!("plugin validation failed: {e}");
            Err(e)
        }
    }
}
