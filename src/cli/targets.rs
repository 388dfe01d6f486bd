//! CLI command for a targeted sequencing run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::config::{Conf, ConfHandle};
use crate::instrument::tcp::FramedTcpTransport;
use crate::instrument::InstrumentTransport;
use crate::pipeline::{run_pipeline, PipelineOptions};
use crate::plugins::{build_aligner, build_caller, Aligner, Caller};

#[derive(Args, Debug)]
pub struct TargetsArgs {
    /// Experiment configuration TOML
    #[arg(long)]
    pub toml: PathBuf,
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
    #[arg(long, default_value = "readsieve")]
    pub experiment_name: String,
    /// Seconds to sleep when no chunks are pending
    #[arg(long, default_value = "0.1")]
    pub throttle: f64,
    /// Seconds of reversed voltage per unblock
    #[arg(long, default_value = "0.5")]
    pub unblock_duration: f64,
    /// Replace unblocks with stop_receiving (nothing is ejected)
    #[arg(long)]
    pub dry_run: bool,
    /// Transport reconnect attempts before giving up
    #[arg(long, default_value = "3")]
    pub reconnect_attempts: u32,
    /// Seconds allowed for the initial instrument connection
    #[arg(long, default_value = "10")]
    pub connect_timeout: f64,
}

pub fn run(args: TargetsArgs) -> Result<()> {
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

    let conf = Conf::from_file(&args.toml, transport.channel_count())?;
    info!("{}", conf.describe());

    let (caller, aligner) = init_plugins(&conf)?;

    // A sibling `<toml>_live` file, when it appears, replaces the
    // configuration wholesale mid-run.
    let mut live_name = args.toml.as_os_str().to_os_string();
    live_name.push("_live");

    let options = PipelineOptions {
        throttle: Duration::from_secs_f64(args.throttle),
        unblock_duration: args.unblock_duration,
        dry_run: args.dry_run,
        reconnect_attempts: args.reconnect_attempts,
        live_toml: Some(PathBuf::from(live_name)),
        ..Default::default()
    };

    let summary = run_pipeline(transport, ConfHandle::new(conf), caller, aligner, options)?;
    info!(
        reads = summary.reads_processed,
        unblocks = summary.unblocks,
        stop_receivings = summary.stop_receivings,
        "run complete"
    );
    Ok(())
}

/// Build and validate both plugins, checking targets against the reference
/// inventory when the aligner can enumerate it.
pub fn init_plugins(conf: &Conf) -> Result<(Box<dyn Caller>, Box<dyn Aligner>)> {
    info!("initialising caller");
    let caller = build_caller(&conf.caller_settings)?;
    caller.validate()?;
    info!("caller initialised: {}", caller.describe());

    info!("initialising aligner");
    let aligner = build_aligner(&conf.mapper_settings)?;
    aligner.validate()?;
    if let Some(contigs) = aligner.reference_contigs() {
        conf.check_reference_contigs(&contigs)?;
    }
    info!("aligner initialised: {}", aligner.describe());

    Ok((caller, aligner))
}
