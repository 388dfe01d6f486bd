//! CLI command that unblocks every read it sees.
//!
//! A rehearsal tool: with pass-through plugins and a policy table that maps
//! every outcome to `unblock`, the full pipeline runs at its fastest and the
//! resulting read-length histogram shows how quickly decisions land on the
//! flow cell. Intended for playback (simulated) runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::config::{Conf, ConfHandle};
use crate::instrument::tcp::FramedTcpTransport;
use crate::instrument::InstrumentTransport;
use crate::pipeline::{run_pipeline, PipelineOptions};
use crate::plugins::{build_aligner, build_caller};

/// Every classification maps to unblock; plugins are pass-through.
pub const UNBLOCK_ALL_TOML: &str = r#"
[caller_settings.no_op]
[mapper_settings.no_op]

[[regions]]
name = "unblock all"
min_chunks = 0
max_chunks = 16
targets = []
single_on = "unblock"
single_off = "unblock"
multi_on = "unblock"
multi_off = "unblock"
no_map = "unblock"
no_seq = "unblock"
above_max_chunks = "unblock"
below_min_chunks = "unblock"
"#;

#[derive(Args, Debug)]
pub struct UnblockAllArgs {
    /// Instrument device identifier (recorded in logs)
    #[arg(long)]
    pub device: String,
    /// Instrument stream host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Instrument stream port
    #[arg(long, default_value = "9501")]
    pub port: u16,
    /// Experiment label
    #[arg(long, default_value = "unblock all")]
    pub experiment_name: String,
    /// Seconds to sleep when no chunks are pending
    #[arg(long, default_value = "0.1")]
    pub throttle: f64,
    /// Seconds of reversed voltage per unblock
    #[arg(long, default_value = "0.5")]
    pub unblock_duration: f64,
    /// Seconds allowed for the initial instrument connection
    #[arg(long, default_value = "10")]
    pub connect_timeout: f64,
}

pub fn run(args: UnblockAllArgs) -> Result<()> {
    info!(
        device = %args.device,
        experiment = %args.experiment_name,
        "connecting to instrument at {}:{}",
        args.host,
        args.port
    );
    let transport: Arc<dyn InstrumentTransport> = Arc::new(
        FramedTcpTransport::connect(
            &args.host,
            args.port,
            Duration::from_secs_f64(args.connect_timeout),
        )
        .with_context(|| format!("device {}", args.device))?,
    );

    let conf = Conf::from_toml_str(UNBLOCK_ALL_TOML, transport.channel_count())
        .context("built-in unblock-all configuration")?;
    let caller = build_caller(&conf.caller_settings)?;
    let aligner = build_aligner(&conf.mapper_settings)?;

    let options = PipelineOptions {
        throttle: Duration::from_secs_f64(args.throttle),
        unblock_duration: args.unblock_duration,
        ..Default::default()
    };

    let summary = run_pipeline(transport, ConfHandle::new(conf), caller, aligner, options)?;
    info!(
        reads = summary.reads_processed,
        unblocks = summary.unblocks,
        "unblock-all complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Decision};

    #[test]
    fn test_builtin_toml_is_valid_and_all_unblock() {
        let conf = Conf::from_toml_str(UNBLOCK_ALL_TOML, 512).unwrap();
        let cond = conf.condition_for(1, None);
        for decision in [
            Decision::SingleOn,
            Decision::SingleOff,
            Decision::MultiOn,
            Decision::MultiOff,
            Decision::NoMap,
            Decision::NoSeq,
            Decision::AboveMaxChunks,
            Decision::BelowMinChunks,
        ] {
            assert_eq!(cond.action_for(decision), Action::Unblock);
        }
    }
}
