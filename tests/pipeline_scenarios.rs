//! End-to-end pipeline scenarios.
//!
//! Each test feeds synthetic chunks through the real driver (playback
//! transport, scripted caller/aligner) and asserts on the actions that were
//! actually dispatched to the instrument, not just on decisions.

use std::sync::Arc;
use std::time::Duration;

use readsieve::config::{Conf, ConfHandle};
use readsieve::error::Result;
use readsieve::instrument::playback::{pair, PlaybackHandle, PlaybackTransport};
use readsieve::instrument::{ActionCommand, RunPhase};
use readsieve::model::{Alignment, Chunk, ReadResult, Strand};
use readsieve::pipeline::{run_pipeline, PipelineOptions, PipelineSummary};
use readsieve::plugins::{Aligner, Caller, ResultStream};

// ---------------------------------------------------------------------------
// Scripted plugins
// ---------------------------------------------------------------------------

/// Gives every chunk the same sequence and barcode.
struct ScriptedCaller {
    seq: String,
    barcode: Option<String>,
}

impl Caller for ScriptedCaller {
    fn basecall<'a>(&'a mut self, chunks: &'a [Chunk]) -> Result<ResultStream<'a>> {
        let seq = self.seq.clone();
        let barcode = self.barcode.clone();
        Ok(Box::new(chunks.iter().map(move |c| {
            let mut r = ReadResult::empty(c.channel, c.read_number, c.read_id.clone());
            r.seq = seq.clone();
            r.barcode = barcode.clone();
            r
        })))
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted caller".into()
    }

    fn disconnect(&mut self) {}
}

/// Attaches the same alignments to every basecalled read.
struct ScriptedAligner {
    alignments: Vec<Alignment>,
}

impl Aligner for ScriptedAligner {
    fn align<'a>(&'a mut self, results: ResultStream<'a>) -> ResultStream<'a> {
        let alignments = &self.alignments;
        Box::new(results.map(move |mut r| {
            if !r.seq.is_empty() {
                r.alignment_data = alignments.iter().cloned().collect();
            }
            r
        }))
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn initialised(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "scripted aligner".into()
    }

    fn disconnect(&mut self) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Scenario {
    conf: String,
    seq: String,
    barcode: Option<String>,
    alignments: Vec<Alignment>,
}

fn region_conf(policy: &str) -> String {
    format!(
        r#"
        [caller_settings.no_op]
        [mapper_settings.no_op]

        [[regions]]
        name = "capture"
        targets = ["chr20"]
        {policy}
        "#
    )
}

const DEFAULT_POLICY: &str = r#"
min_chunks = 0
max_chunks = 8
single_on = "stop_receiving"
single_off = "unblock"
multi_on = "stop_receiving"
multi_off = "unblock"
no_map = "proceed"
no_seq = "proceed"
"#;

fn aln(contig: &str, strand: Strand, r_st: u64, r_en: u64) -> Alignment {
    Alignment {
        contig: contig.into(),
        strand,
        r_st,
        r_en,
        mapq: 60,
    }
}

fn chunk(channel: u32, read_number: u32, start: u64) -> Chunk {
    Chunk {
        channel,
        read_number,
        read_id: format!("read-{channel}-{read_number}"),
        raw_signal: vec![0; 16],
        chunk_start_sample: start,
        chunk_length: 16,
        median_before: 220.0,
        median: 90.0,
        classifications: Vec::new(),
    }
}

fn spawn_pipeline(
    scenario: Scenario,
    transport: PlaybackTransport,
) -> std::thread::JoinHandle<PipelineSummary> {
    std::thread::spawn(move || {
        let conf = Conf::from_toml_str(&scenario.conf, 512).expect("scenario conf is valid");
        run_pipeline(
            Arc::new(transport),
            ConfHandle::new(conf),
            Box::new(ScriptedCaller {
                seq: scenario.seq,
                barcode: scenario.barcode,
            }),
            Box::new(ScriptedAligner {
                alignments: scenario.alignments,
            }),
            PipelineOptions {
                throttle: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .expect("pipeline runs to completion")
    })
}

/// Feed all chunks at once, close the stream, run to completion.
fn run_scenario(scenario: Scenario, chunks: Vec<Chunk>) -> (PipelineSummary, Vec<ActionCommand>) {
    let (transport, handle) = pair(512, 1.0);
    handle.set_phase(RunPhase::Sequencing);
    for c in chunks {
        handle.send_chunk(c);
    }
    let actions_rx = handle.close();
    let pipeline = spawn_pipeline(scenario, transport);
    let summary = pipeline.join().expect("pipeline thread");
    let actions: Vec<ActionCommand> = actions_rx.try_iter().collect();
    (summary, actions)
}

fn interactive(scenario: Scenario) -> (PlaybackHandle, std::thread::JoinHandle<PipelineSummary>) {
    let (transport, handle) = pair(512, 1.0);
    handle.set_phase(RunPhase::Sequencing);
    let pipeline = spawn_pipeline(scenario, transport);
    (handle, pipeline)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A single on-target hit stops receiving.
#[test]
fn single_on_target_hit_stops_receiving() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chr20", Strand::Forward, 0, 500)],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(100, 1, 0)]);
    assert_eq!(
        actions,
        vec![ActionCommand::StopReceiving {
            channel: 100,
            read_number: 1
        }]
    );
    assert_eq!(summary.stop_receivings, 1);
    assert_eq!(summary.unblocks, 0);
}

/// A single off-target hit is ejected.
#[test]
fn single_off_target_hit_unblocks() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chrX", Strand::Forward, 0, 500)],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(100, 1, 0)]);
    match &actions[..] {
        [ActionCommand::Unblock {
            channel: 100,
            read_number: 1,
            duration,
        }] => assert!((duration - 0.5).abs() < f64::EPSILON),
        other => panic!("expected one unblock, got {other:?}"),
    }
    assert_eq!(summary.unblocks, 1);
}

/// An unmapped read with `no_map = proceed` dispatches nothing.
#[test]
fn no_map_proceeds_silently() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(100, 1, 0)]);
    assert!(actions.is_empty());
    assert_eq!(summary.reads_processed, 1);
}

/// A read that did not basecall dispatches nothing.
#[test]
fn no_seq_proceeds_silently() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: String::new(),
        barcode: None,
        alignments: vec![aln("chr20", Strand::Forward, 0, 500)],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(100, 1, 0)]);
    assert!(actions.is_empty());
    assert_eq!(summary.reads_processed, 1);
}

/// A control region classifies but never acts.
#[test]
fn control_region_never_acts() {
    let scenario = Scenario {
        conf: region_conf(&format!("control = true\n{DEFAULT_POLICY}")),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chr20", Strand::Forward, 0, 500)],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(100, 1, 0)]);
    assert!(actions.is_empty());
    assert_eq!(summary.stop_receivings, 0);
    assert_eq!(summary.unblocks, 0);
    assert_eq!(summary.reads_processed, 1);
}

/// Repeated off-target chunks for one read yield exactly one unblock,
/// even across separate batches.
#[test]
fn repeated_unblock_is_idempotent() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chrX", Strand::Forward, 0, 500)],
    };
    let (handle, pipeline) = interactive(scenario);

    handle.send_chunk(chunk(100, 1, 0));
    let first = handle.wait_for_actions(1, Duration::from_secs(5));
    assert_eq!(first.len(), 1);
    assert!(matches!(first[0], ActionCommand::Unblock { .. }));

    // Late chunks for the same read are recognised and suppressed.
    handle.send_chunk(chunk(100, 1, 4000));
    handle.send_chunk(chunk(100, 1, 8000));
    let more = handle.collect_actions(Duration::from_millis(300));
    assert!(more.is_empty(), "unexpected actions: {more:?}");

    let actions_rx = handle.close();
    let summary = pipeline.join().expect("pipeline thread");
    assert_eq!(summary.unblocks, 1);
    assert!(actions_rx.try_iter().next().is_none());
}

/// The max-chunks branch supersedes an on-target classification.
#[test]
fn above_max_chunks_supersedes_on_target() {
    let policy = r#"
        min_chunks = 0
        max_chunks = 2
        single_on = "proceed"
        single_off = "proceed"
        multi_on = "proceed"
        multi_off = "proceed"
        no_map = "proceed"
        no_seq = "proceed"
        above_max_chunks = "unblock"
    "#;
    let scenario = Scenario {
        conf: region_conf(policy),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![
            aln("chr20", Strand::Forward, 0, 500),
            aln("chrX", Strand::Forward, 0, 500),
        ],
    };
    let (handle, pipeline) = interactive(scenario);

    // Chunks 1 and 2: multi_on -> proceed, nothing dispatched.
    handle.send_chunk(chunk(100, 1, 0));
    assert!(handle.collect_actions(Duration::from_millis(300)).is_empty());
    handle.send_chunk(chunk(100, 1, 4000));
    assert!(handle.collect_actions(Duration::from_millis(300)).is_empty());

    // Chunk 3 exceeds max_chunks: unblock despite the on-target hit.
    handle.send_chunk(chunk(100, 1, 8000));
    let third = handle.wait_for_actions(1, Duration::from_secs(5));
    match &third[..] {
        [ActionCommand::Unblock {
            channel: 100,
            read_number: 1,
            ..
        }] => {}
        other => panic!("expected unblock on chunk 3, got {other:?}"),
    }

    handle.close();
    let summary = pipeline.join().expect("pipeline thread");
    assert_eq!(summary.unblocks, 1);
    assert_eq!(summary.stop_receivings, 0);
}

/// An unclassified barcode read follows the unclassified barcode policy.
#[test]
fn unclassified_barcode_uses_barcode_policy() {
    let conf = r#"
        [caller_settings.no_op]
        [mapper_settings.no_op]

        [barcodes.classified]
        min_chunks = 0
        max_chunks = 8
        targets = ["chr20"]
        single_on = "stop_receiving"
        single_off = "proceed"
        multi_on = "proceed"
        multi_off = "proceed"
        no_map = "proceed"
        no_seq = "proceed"

        [barcodes.unclassified]
        min_chunks = 0
        max_chunks = 8
        targets = []
        single_on = "proceed"
        single_off = "proceed"
        multi_on = "proceed"
        multi_off = "proceed"
        no_map = "unblock"
        no_seq = "proceed"
    "#;
    let scenario = Scenario {
        conf: conf.into(),
        seq: "ACGT".repeat(100),
        barcode: Some("unclassified".into()),
        alignments: vec![],
    };
    let (summary, actions) = run_scenario(scenario, vec![chunk(42, 7, 0)]);
    match &actions[..] {
        [ActionCommand::Unblock {
            channel: 42,
            read_number: 7,
            ..
        }] => {}
        other => panic!("expected unblock, got {other:?}"),
    }
    assert_eq!(summary.unblocks, 1);
}

/// Mixed batch: several channels decided independently in one run.
#[test]
fn mixed_batch_dispatches_per_channel() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chrX", Strand::Forward, 0, 500)],
    };
    let chunks = (1..=20).map(|ch| chunk(ch, 1, 0)).collect();
    let (summary, actions) = run_scenario(scenario, chunks);
    assert_eq!(summary.unblocks, 20);
    assert_eq!(actions.len(), 20);
    let mut channels: Vec<u32> = actions.iter().map(|a| a.channel()).collect();
    channels.sort_unstable();
    assert_eq!(channels, (1..=20).collect::<Vec<u32>>());
}

/// The pipeline idles outside the sequencing phase and nothing is dispatched.
#[test]
fn chunks_outside_sequencing_phase_are_not_analysed() {
    let scenario = Scenario {
        conf: region_conf(DEFAULT_POLICY),
        seq: "ACGT".repeat(100),
        barcode: None,
        alignments: vec![aln("chrX", Strand::Forward, 0, 500)],
    };
    let (transport, handle) = pair(512, 1.0);
    handle.set_phase(RunPhase::MuxScan);
    handle.send_chunk(chunk(100, 1, 0));
    let pipeline = spawn_pipeline(scenario, transport);
    assert!(handle.collect_actions(Duration::from_millis(400)).is_empty());
    handle.close();
    let summary = pipeline.join().expect("pipeline thread");
    assert_eq!(summary.reads_processed, 0);
    assert_eq!(summary.batches, 0);
}
