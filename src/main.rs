use anyhow::Result;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    // The per-batch "NR/xs" lines are the run's heartbeat, so log at info
    // unless RUST_LOG says otherwise. The per-chunk decision trace is
    // opt-in: RUST_LOG=readsieve::chunks=debug.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    readsieve::cli::run()
}
