//! Decision engine — classify a mapped read and look up its action.
//!
//! A pure function of the configuration, the result, and the tracker's chunk
//! count. It never fails: malformed alignment records downgrade the read to
//! `no_map` with a warning, and every input produces a decision and an
//! action.

use crate::config::{Condition, Conf};
use crate::model::{Action, Decision, ReadResult};

/// The decision plus the action the condition's table maps it to (after the
/// control override).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub action: Action,
    /// Whether the governing condition is a control (observation-only).
    pub control: bool,
}

/// Decide a read's fate under the condition the configuration assigns it.
pub fn decide(conf: &Conf, result: &ReadResult, chunk_count: u32) -> Verdict {
    let condition = conf.condition_for(result.channel, result.barcode.as_deref());
    decide_for(condition, result, chunk_count)
}

/// Decide a read's fate under an already-resolved condition.
///
/// Gating order: the min-chunks gate, then the max-chunks gate, then
/// classification against the condition's targets. The max-chunks branch
/// deliberately supersedes an on-target classification reached in the same
/// batch. Control conditions classify normally but always act `proceed`.
pub fn decide_for(condition: &Condition, result: &ReadResult, chunk_count: u32) -> Verdict {
    let decision = if chunk_count < condition.min_chunks {
        Decision::BelowMinChunks
    } else if chunk_count > condition.max_chunks {
        Decision::AboveMaxChunks
    } else {
        classify(condition, result)
    };

    let action = if condition.control {
        Action::Proceed
    } else {
        condition.action_for(decision)
    };

    Verdict {
        decision,
        action,
        control: condition.control,
    }
}

/// Classify by sequence and alignments alone.
fn classify(condition: &Condition, result: &ReadResult) -> Decision {
    if result.seq.is_empty() {
        return Decision::NoSeq;
    }
    if result.alignment_data.is_empty() {
        return Decision::NoMap;
    }
    if result.alignment_data.iter().any(|a| a.contig.is_empty()) {
        tracing::warn!(
            read_id = %result.read_id,
            channel = result.channel,
            "alignment with empty contig; treating read as unmapped"
        );
        return Decision::NoMap;
    }
    // The coordinate is the 3' end of the alignment on the sequencing
    // strand: r_en on '+', r_st on '-'.
    let on_target = result.alignment_data.iter().any(|a| {
        condition
            .targets
            .check_coord(&a.contig, a.strand, a.query_coord())
    });
    match (result.alignment_data.len(), on_target) {
        (1, true) => Decision::SingleOn,
        (1, false) => Decision::SingleOff,
        (_, true) => Decision::MultiOn,
        (_, false) => Decision::MultiOff,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Alignment, ReadResult, Strand};
    use smallvec::smallvec;

    fn conf_with(min_chunks: u32, max_chunks: u32, control: bool) -> Conf {
        let text = format!(
            r#"
            [caller_settings.no_op]
            [mapper_settings.no_op]

            [[regions]]
            name = "select"
            control = {control}
            min_chunks = {min_chunks}
            max_chunks = {max_chunks}
            targets = ["chr20,0,1000,+", "chr20,0,1000,-"]
            single_on = "stop_receiving"
            single_off = "unblock"
            multi_on = "stop_receiving"
            multi_off = "unblock"
            no_map = "proceed"
            no_seq = "proceed"
            "#
        );
        Conf::from_toml_str(&text, 512).unwrap()
    }

    fn conf() -> Conf {
        conf_with(0, 10, false)
    }

    fn mapped(alignments: Vec<Alignment>) -> ReadResult {
        let mut r = ReadResult::empty(100, 1, "r".into());
        r.seq = "ACGT".repeat(50);
        r.alignment_data = alignments.into_iter().collect();
        r
    }

    fn aln(contig: &str, strand: Strand, r_st: u64, r_en: u64) -> Alignment {
        Alignment {
            contig: contig.into(),
            strand,
            r_st,
            r_en,
            mapq: 60,
        }
    }

    #[test]
    fn test_single_on_uses_r_en_on_forward() {
        let conf = conf();
        // Pin down which coordinate is queried, not just whether the
        // alignment touches the target.
        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Forward, 0, 500)]), 1);
        assert_eq!(v.decision, Decision::SingleOn);
        assert_eq!(v.action, Action::StopReceiving);

        // Forward alignment whose end is outside the target: off despite the
        // start being inside.
        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Forward, 500, 2000)]), 1);
        assert_eq!(v.decision, Decision::SingleOff);
        assert_eq!(v.action, Action::Unblock);
    }

    #[test]
    fn test_single_on_uses_r_st_on_reverse() {
        let conf = conf();
        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Reverse, 500, 2000)]), 1);
        assert_eq!(v.decision, Decision::SingleOn);

        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Reverse, 1500, 2000)]), 1);
        assert_eq!(v.decision, Decision::SingleOff);
    }

    #[test]
    fn test_multi_classification() {
        let conf = conf();
        let v = decide(
            &conf,
            &mapped(vec![
                aln("chrX", Strand::Forward, 0, 500),
                aln("chr20", Strand::Forward, 0, 500),
            ]),
            1,
        );
        assert_eq!(v.decision, Decision::MultiOn);

        let v = decide(
            &conf,
            &mapped(vec![
                aln("chrX", Strand::Forward, 0, 500),
                aln("chrY", Strand::Forward, 0, 500),
            ]),
            1,
        );
        assert_eq!(v.decision, Decision::MultiOff);
    }

    #[test]
    fn test_no_map_and_no_seq() {
        let conf = conf();
        let v = decide(&conf, &mapped(vec![]), 1);
        assert_eq!(v.decision, Decision::NoMap);
        assert_eq!(v.action, Action::Proceed);

        let empty = ReadResult::empty(100, 1, "r".into());
        let v = decide(&conf, &empty, 1);
        assert_eq!(v.decision, Decision::NoSeq);
    }

    #[test]
    fn test_empty_contig_downgrades_to_no_map() {
        let conf = conf();
        let v = decide(&conf, &mapped(vec![aln("", Strand::Forward, 0, 500)]), 1);
        assert_eq!(v.decision, Decision::NoMap);
        assert_eq!(v.action, Action::Proceed);
    }

    #[test]
    fn test_below_min_chunks_gate() {
        let conf = conf_with(2, 10, false);
        // On-target read, but only one chunk seen.
        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Forward, 0, 500)]), 1);
        assert_eq!(v.decision, Decision::BelowMinChunks);
        assert_eq!(v.action, Action::Proceed);
    }

    #[test]
    fn test_min_chunks_zero_never_fires() {
        let conf = conf();
        let v = decide(&conf, &ReadResult::empty(100, 1, "r".into()), 1);
        assert_ne!(v.decision, Decision::BelowMinChunks);
    }

    #[test]
    fn test_above_max_supersedes_on_target_hit() {
        let conf = conf_with(0, 2, false);
        let read = mapped(vec![aln("chr20", Strand::Forward, 0, 500)]);
        let v = decide(&conf, &read, 2);
        assert_eq!(v.decision, Decision::SingleOn);
        // Chunk 3 takes the above_max_chunks branch, default unblock.
        let v = decide(&conf, &read, 3);
        assert_eq!(v.decision, Decision::AboveMaxChunks);
        assert_eq!(v.action, Action::Unblock);
    }

    #[test]
    fn test_control_collapses_action_to_proceed() {
        let conf = conf_with(0, 10, true);
        let v = decide(&conf, &mapped(vec![aln("chr20", Strand::Forward, 0, 500)]), 1);
        // Classification still runs for statistics.
        assert_eq!(v.decision, Decision::SingleOn);
        assert_eq!(v.action, Action::Proceed);
        assert!(v.control);
    }

    #[test]
    fn test_smallvec_roundtrip() {
        let mut r = ReadResult::empty(1, 1, "r".into());
        r.alignment_data = smallvec![aln("chr1", Strand::Forward, 0, 10)];
        assert_eq!(r.alignment_data.len(), 1);
    }
}
