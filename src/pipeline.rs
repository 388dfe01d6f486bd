//! Pipeline driver — drain, basecall, align, decide, dispatch.
//!
//! Three threads share the work: a reader drains the instrument stream into
//! the chunk cache, the driver (this thread) runs batches through the
//! caller → aligner → decision path, and a dispatcher pushes action batches
//! back to the instrument. Bounded crossbeam channels sit between them; the
//! driver blocks only on in-flight plugin work and on the throttle sleep
//! when the cache is empty.
//!
//! The per-batch wall time is the latency budget: a batch slower than the
//! instrument's chunk duration means decisions arrive after another chunk
//! has already been sequenced. Slow batches are counted and a rolling window
//! warns when they dominate.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel;
use tracing::{debug, error, info, warn};

use crate::cache::ReadChunkCache;
use crate::config::ConfHandle;
use crate::decision::decide_for;
use crate::error::Error;
use crate::instrument::{ActionCommand, InstrumentEvent, InstrumentTransport, RunPhase};
use crate::model::{Action, Chunk, ReadResult};
use crate::plugins::{Aligner, Caller};
use crate::tracker::{ActionOutcome, ActionTracker};

// ---------------------------------------------------------------------------
// PipelineOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Sleep when the cache has nothing pending.
    pub throttle: Duration,
    /// Seconds of reversed voltage per unblock command.
    pub unblock_duration: f64,
    /// Replace unblocks with stop_receiving; for rehearsing a configuration
    /// against a live flow cell without ejecting anything.
    pub dry_run: bool,
    /// Transport reconnect budget before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    /// Path polled for a live configuration replacement.
    pub live_toml: Option<PathBuf>,
    /// Rolling slow-batch window and the fraction that triggers a warning.
    pub slow_batch_window: usize,
    pub slow_batch_warn_fraction: f64,
    /// Cadence of the tracker's terminal-marker sweep.
    pub gc_interval: Duration,
    /// Cooperative shutdown flag for embedders.
    pub shutdown: Option<Arc<AtomicBool>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            unblock_duration: 0.5,
            dry_run: false,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
            live_toml: None,
            slow_batch_window: 32,
            slow_batch_warn_fraction: 0.5,
            gc_interval: Duration::from_secs(30),
            shutdown: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineSummary
// ---------------------------------------------------------------------------

/// Final accounting, logged once at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches: u64,
    pub slow_batches: u64,
    pub reads_processed: u64,
    pub unblocks: u64,
    pub stop_receivings: u64,
    /// Chunks discarded because their read already had a terminal action.
    pub dropped_terminal: u64,
    /// Cache accounting: newer chunk for the same read / new read took the
    /// channel / out-of-range channel.
    pub cache_replaced: u64,
    pub cache_displaced: u64,
    pub cache_rejected: u64,
}

// ---------------------------------------------------------------------------
// Plugin teardown guard
// ---------------------------------------------------------------------------

/// Owns both plugins and disconnects them on every exit path, panics
/// included.
struct PluginGuard {
    caller: Box<dyn Caller>,
    aligner: Box<dyn Aligner>,
}

impl Drop for PluginGuard {
    fn drop(&mut self) {
        self.caller.disconnect();
        self.aligner.disconnect();
        info!("caller and aligner disconnected");
    }
}

// ---------------------------------------------------------------------------
// run_pipeline
// ---------------------------------------------------------------------------

fn phase_to_u8(phase: RunPhase) -> u8 {
    match phase {
        RunPhase::Initialising => 0,
        RunPhase::MuxScan => 1,
        RunPhase::Sequencing => 2,
        RunPhase::Paused => 3,
        RunPhase::Complete => 4,
    }
}

/// Run the adaptive-sampling loop until the instrument stream ends, the run
/// completes, the transport dies beyond its reconnect budget, or the
/// shutdown flag is raised.
pub fn run_pipeline(
    transport: Arc<dyn InstrumentTransport>,
    conf: ConfHandle,
    caller: Box<dyn Caller>,
    aligner: Box<dyn Aligner>,
    options: PipelineOptions,
) -> Result<PipelineSummary> {
    let cache = ReadChunkCache::new(transport.channel_count());
    let mut guard = PluginGuard { caller, aligner };

    let stop = AtomicBool::new(false);
    let phase = AtomicU8::new(phase_to_u8(RunPhase::Initialising));
    let (ended_tx, ended_rx) = channel::unbounded::<(u32, u32)>();
    let (action_tx, action_rx) = channel::bounded::<Vec<ActionCommand>>(4);

    let summary = crossbeam::scope(|scope| {
        // Reader: instrument stream -> cache.
        {
            let transport = transport.clone();
            let cache = &cache;
            let stop = &stop;
            let phase = &phase;
            let options = options.clone();
            scope.spawn(move |_| {
                reader_loop(transport, cache, stop, phase, ended_tx, &options);
            });
        }

        // Dispatcher: action batches -> instrument.
        {
            let transport = transport.clone();
            let stop = &stop;
            scope.spawn(move |_| {
                while let Ok(batch) = action_rx.recv() {
                    if let Err(e) = transport.send_actions(&batch) {
                        error!(error = %e, "failed to dispatch actions; stopping");
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            });
        }

        // Driver runs on this thread.
        driver_loop(
            &transport,
            &conf,
            &mut guard,
            &cache,
            &stop,
            &phase,
            ended_rx,
            action_tx,
            &options,
        )
    })
    .map_err(|e| anyhow::anyhow!("pipeline thread panicked: {e:?}"))??;

    drop(guard);
    Ok(summary)
}

fn reader_loop(
    transport: Arc<dyn InstrumentTransport>,
    cache: &ReadChunkCache,
    stop: &AtomicBool,
    phase: &AtomicU8,
    ended_tx: channel::Sender<(u32, u32)>,
    options: &PipelineOptions,
) {
    let mut attempts = 0u32;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match transport.next_event() {
            Ok(Some(InstrumentEvent::Chunk(chunk))) => {
                attempts = 0;
                cache.insert(chunk);
            }
            Ok(Some(InstrumentEvent::Phase { phase: p })) => {
                attempts = 0;
                info!(phase = ?p, "instrument phase changed");
                phase.store(phase_to_u8(p), Ordering::Relaxed);
                if p.is_final() {
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
            }
            Ok(Some(InstrumentEvent::ReadEnded {
                channel,
                read_number,
            })) => {
                attempts = 0;
                ended_tx.send((channel, read_number)).ok();
            }
            Ok(None) => {
                info!("instrument stream ended");
                stop.store(true, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                attempts += 1;
                if attempts > options.reconnect_attempts {
                    error!(error = %e, "transport lost and reconnect budget exhausted");
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
                warn!(
                    error = %e,
                    attempt = attempts,
                    budget = options.reconnect_attempts,
                    "transport fault; attempting reconnect"
                );
                std::thread::sleep(options.reconnect_backoff);
                if let Err(e) = transport.reconnect() {
                    warn!(error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

/// Driver-owned mutable state threaded through batch processing.
struct DriverState {
    tracker: ActionTracker,
    summary: PipelineSummary,
    slow_window: VecDeque<bool>,
    iteration: u64,
    chunk_seconds: f64,
}

#[allow(clippy::too_many_arguments)]
fn driver_loop(
    transport: &Arc<dyn InstrumentTransport>,
    conf_handle: &ConfHandle,
    guard: &mut PluginGuard,
    cache: &ReadChunkCache,
    stop: &AtomicBool,
    phase: &AtomicU8,
    ended_rx: channel::Receiver<(u32, u32)>,
    action_tx: channel::Sender<Vec<ActionCommand>>,
    options: &PipelineOptions,
) -> Result<PipelineSummary> {
    let mut state = DriverState {
        tracker: ActionTracker::new(transport.channel_count()),
        summary: PipelineSummary::default(),
        slow_window: VecDeque::with_capacity(options.slow_batch_window),
        iteration: 0,
        chunk_seconds: transport.chunk_seconds(),
    };
    let mut last_gc = Instant::now();
    let mut last_live_mtime: Option<std::time::SystemTime> = None;
    let mut fatal = false;

    let shutdown_requested = || {
        options
            .shutdown
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    };

    info!("starting main loop");
    loop {
        if stop.load(Ordering::Relaxed) || shutdown_requested() {
            break;
        }

        // Terminal markers of finished reads outlive the read via TTL only.
        while let Ok((channel, read_number)) = ended_rx.try_recv() {
            state.tracker.read_ended(channel, read_number);
        }
        if last_gc.elapsed() >= options.gc_interval {
            state.tracker.gc();
            last_gc = Instant::now();
        }

        maybe_reload_config(conf_handle, transport, options, &mut last_live_mtime);

        let sequencing = phase.load(Ordering::Relaxed) == phase_to_u8(RunPhase::Sequencing);
        if !sequencing || !guard.aligner.initialised() {
            std::thread::sleep(options.throttle);
            continue;
        }

        match process_batch(&mut state, guard, cache, conf_handle, &action_tx, options) {
            Ok(true) => {}
            Ok(false) => {
                // Dispatcher died; its error already raised the stop flag.
                break;
            }
            Err(e) => {
                error!(error = %e, "basecaller unrecoverable; shutting down");
                stop.store(true, Ordering::Relaxed);
                fatal = true;
                break;
            }
        }

        if cache.is_empty() {
            std::thread::sleep(options.throttle);
        }
    }

    // Whatever ended the loop, make sure the reader and dispatcher wind
    // down too.
    stop.store(true, Ordering::Relaxed);

    // Drain what the reader deposited between the last batch and shutdown;
    // the instrument may or may not still be listening for the actions.
    let was_sequencing = phase.load(Ordering::Relaxed) == phase_to_u8(RunPhase::Sequencing);
    if !fatal && was_sequencing {
        if let Err(e) = process_batch(&mut state, guard, cache, conf_handle, &action_tx, options) {
            warn!(error = %e, "final drain could not be basecalled");
        }
    }

    let leftover = cache.drain().len();
    let (replaced, displaced, rejected) = cache.stats();
    let mut summary = state.summary;
    summary.cache_replaced = replaced;
    summary.cache_displaced = displaced;
    summary.cache_rejected = rejected;
    info!(
        batches = summary.batches,
        slow_batches = summary.slow_batches,
        reads = summary.reads_processed,
        unblocks = summary.unblocks,
        stop_receivings = summary.stop_receivings,
        dropped_terminal = summary.dropped_terminal,
        cache_replaced = summary.cache_replaced,
        cache_displaced = summary.cache_displaced,
        leftover_chunks = leftover,
        "pipeline finished"
    );
    Ok(summary)
}

/// Drain the cache and run one batch through call → align → decide →
/// dispatch. `Ok(true)` to keep looping, `Ok(false)` when the dispatcher is
/// gone, `Err` on an unrecoverable caller failure.
fn process_batch(
    state: &mut DriverState,
    guard: &mut PluginGuard,
    cache: &ReadChunkCache,
    conf_handle: &ConfHandle,
    action_tx: &channel::Sender<Vec<ActionCommand>>,
    options: &PipelineOptions,
) -> Result<bool, Error> {
    let drained = cache.drain();
    if drained.is_empty() {
        return Ok(true);
    }

    state.iteration += 1;
    let start = Instant::now();

    // Update chunk counts and discard chunks of finalised reads before
    // spending basecall time on them.
    let mut chunks: Vec<Chunk> = Vec::with_capacity(drained.len());
    for entry in drained {
        let (channel, read_number) = (entry.chunk.channel, entry.chunk.read_number);
        if state.tracker.is_terminal(channel, read_number) {
            state.summary.dropped_terminal += 1;
            continue;
        }
        state.tracker.note_chunks(channel, read_number, entry.chunk_count);
        chunks.push(entry.chunk);
    }
    if chunks.is_empty() {
        return Ok(true);
    }

    let called = basecall_with_retry(guard.caller.as_mut(), &chunks, options)?;

    let conf = conf_handle.get();
    let mut actions: Vec<ActionCommand> = Vec::new();
    let mut batch_reads = 0u64;
    for mut result in guard.aligner.align(Box::new(called.into_iter())) {
        batch_reads += 1;
        let n = state.tracker.chunk_count(result.channel, result.read_number);
        let condition = conf.condition_for(result.channel, result.barcode.as_deref());
        let verdict = decide_for(condition, &result, n);
        result.decision = verdict.decision;

        let mut action = verdict.action;
        if options.dry_run && action == Action::Unblock {
            action = Action::StopReceiving;
        }

        if let Some(outcome) = state.tracker.record(&result, action) {
            actions.push(to_command(outcome, options.unblock_duration));
            match outcome {
                ActionOutcome::Unblock { .. } => state.summary.unblocks += 1,
                ActionOutcome::StopReceiving { .. } => state.summary.stop_receivings += 1,
            }
        }

        trace_chunk(state.iteration, &result, n, action, &condition.name);
    }
    state.summary.reads_processed += batch_reads;

    if !actions.is_empty() && action_tx.send(actions).is_err() {
        return Ok(false);
    }

    let elapsed = start.elapsed();
    state.summary.batches += 1;
    let slow = elapsed.as_secs_f64() > state.chunk_seconds;
    if slow {
        state.summary.slow_batches += 1;
    }
    track_slow_window(&mut state.slow_window, slow, options);
    if batch_reads > 0 {
        info!("{}R/{:.5}s", batch_reads, elapsed.as_secs_f64());
    }
    Ok(true)
}

fn to_command(outcome: ActionOutcome, unblock_duration: f64) -> ActionCommand {
    match outcome {
        ActionOutcome::Unblock {
            channel,
            read_number,
        } => ActionCommand::Unblock {
            channel,
            read_number,
            duration: unblock_duration,
        },
        ActionOutcome::StopReceiving {
            channel,
            read_number,
        } => ActionCommand::StopReceiving {
            channel,
            read_number,
        },
    }
}

fn basecall_with_retry(
    caller: &mut dyn Caller,
    chunks: &[Chunk],
    options: &PipelineOptions,
) -> Result<Vec<ReadResult>, Error> {
    let mut attempts = 0u32;
    loop {
        let e = match caller.basecall(chunks) {
            Ok(stream) => return Ok(stream.collect()),
            Err(e) => e,
        };
        attempts += 1;
        if attempts > options.reconnect_attempts {
            return Err(e);
        }
        warn!(
            error = %e,
            attempt = attempts,
            budget = options.reconnect_attempts,
            "basecall failed; attempting caller reconnect"
        );
        std::thread::sleep(options.reconnect_backoff);
        if let Err(e) = caller.reconnect() {
            warn!(error = %e, "caller reconnect failed");
        }
    }
}

fn maybe_reload_config(
    conf_handle: &ConfHandle,
    transport: &Arc<dyn InstrumentTransport>,
    options: &PipelineOptions,
    last_mtime: &mut Option<std::time::SystemTime>,
) {
    let Some(path) = &options.live_toml else {
        return;
    };
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    let Ok(mtime) = meta.modified() else {
        return;
    };
    if Some(mtime) == *last_mtime {
        return;
    }
    *last_mtime = Some(mtime);
    match crate::config::Conf::from_file(path, transport.channel_count()) {
        Ok(new_conf) => {
            conf_handle.swap(new_conf);
            info!(path = %path.display(), "live configuration reloaded");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "live configuration rejected; keeping previous");
        }
    }
}

fn track_slow_window(window: &mut VecDeque<bool>, slow: bool, options: &PipelineOptions) {
    if options.slow_batch_window == 0 {
        return;
    }
    window.push_back(slow);
    if window.len() < options.slow_batch_window {
        return;
    }
    let slow_count = window.iter().filter(|&&s| s).count();
    let fraction = slow_count as f64 / window.len() as f64;
    if fraction > options.slow_batch_warn_fraction {
        warn!(
            slow = slow_count,
            window = window.len(),
            "batch latency exceeds the chunk duration too often; decisions are arriving late"
        );
    }
    window.clear();
}

fn trace_chunk(iteration: u64, result: &ReadResult, n: u32, action: Action, condition: &str) {
    debug!(
        target: "readsieve::chunks",
        iteration,
        read_id = %result.read_id,
        channel = result.channel,
        read_number = result.read_number,
        seq_len = result.seq.len(),
        chunks = n,
        decision = result.decision.as_str(),
        action = action.as_str(),
        condition,
        barcode = result.barcode.as_deref().unwrap_or("-"),
        "chunk"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_window_warns_and_resets() {
        let options = PipelineOptions {
            slow_batch_window: 4,
            slow_batch_warn_fraction: 0.5,
            ..Default::default()
        };
        let mut window = VecDeque::new();
        for _ in 0..3 {
            track_slow_window(&mut window, true, &options);
        }
        assert_eq!(window.len(), 3);
        track_slow_window(&mut window, true, &options);
        // Window full: evaluated and cleared.
        assert!(window.is_empty());
    }

    #[test]
    fn test_to_command_carries_duration() {
        let cmd = to_command(
            ActionOutcome::Unblock {
                channel: 1,
                read_number: 2,
            },
            0.75,
        );
        assert_eq!(
            cmd,
            ActionCommand::Unblock {
                channel: 1,
                read_number: 2,
                duration: 0.75
            }
        );
    }

    #[test]
    fn test_default_options() {
        let options = PipelineOptions::default();
        assert_eq!(options.throttle, Duration::from_millis(100));
        assert_eq!(options.unblock_duration, 0.5);
        assert!(!options.dry_run);
    }
}
