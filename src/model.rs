//! Core data model — chunks, results, alignments, decisions, actions.
//!
//! A [`Chunk`] is one delivery of raw signal from the instrument. The caller
//! plugin turns a chunk into a [`ReadResult`]; the aligner plugin attaches
//! [`Alignment`]s; the decision engine fills in the [`Decision`]; the action
//! tracker converts that into at most one dispatched [`Action`] per read.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// One raw-signal delivery from the instrument for an in-progress read.
///
/// Chunks for the same read share `channel`, `read_number`, and `read_id`.
/// `raw_signal` is the instrument's native sample encoding; the caller plugin
/// owns its interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
    #[serde(default)]
    pub raw_signal: Vec<u8>,
    #[serde(default)]
    pub chunk_start_sample: u64,
    #[serde(default)]
    pub chunk_length: u64,
    #[serde(default)]
    pub median_before: f32,
    #[serde(default)]
    pub median: f32,
    #[serde(default)]
    pub classifications: Vec<String>,
}

// ---------------------------------------------------------------------------
// Strand
// ---------------------------------------------------------------------------

/// Reference strand of an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

impl Strand {
    /// Parse the conventional `+`/`-` (or `1`/`-1`) encodings.
    pub fn parse(s: &str) -> Option<Strand> {
        match s {
            "+" | "1" => Some(Strand::Forward),
            "-" | "-1" => Some(Strand::Reverse),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
        })
    }
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

/// One alignment of a nascent read against the reference.
///
/// `r_st`/`r_en` are zero-based half-open reference coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    pub contig: String,
    pub strand: Strand,
    pub r_st: u64,
    pub r_en: u64,
    #[serde(default)]
    pub mapq: u32,
}

impl Alignment {
    /// The 3' end of the alignment on the sequencing strand: where the
    /// molecule currently is, given what has already gone through the pore.
    /// Forward alignments extend towards `r_en`; reverse towards `r_st`.
    pub fn query_coord(&self) -> u64 {
        match self.strand {
            Strand::Forward => self.r_en,
            Strand::Reverse => self.r_st,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision / Action
// ---------------------------------------------------------------------------

/// Classification of a read after basecall and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// A single alignment inside a target region.
    SingleOn,
    /// A single alignment, outside every target region.
    SingleOff,
    /// Multiple alignments, at least one inside a target region.
    MultiOn,
    /// Multiple alignments, all outside the target regions.
    MultiOff,
    /// Basecalled but unaligned.
    NoMap,
    /// Did not basecall.
    NoSeq,
    /// More chunks collected than the condition's `max_chunks`.
    AboveMaxChunks,
    /// Fewer chunks collected than the condition's `min_chunks`.
    BelowMinChunks,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::SingleOn => "single_on",
            Decision::SingleOff => "single_off",
            Decision::MultiOn => "multi_on",
            Decision::MultiOff => "multi_off",
            Decision::NoMap => "no_map",
            Decision::NoSeq => "no_seq",
            Decision::AboveMaxChunks => "above_max_chunks",
            Decision::BelowMinChunks => "below_min_chunks",
        }
    }
}

/// Command issued back to the instrument for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Reverse the pore voltage, ejecting the molecule.
    Unblock,
    /// Let the read finish naturally but stop streaming its chunks.
    StopReceiving,
    /// Wait for another chunk before re-deciding.
    Proceed,
}

impl Action {
    /// Parse a TOML action token.
    pub fn parse(s: &str) -> Option<Action> {
        match s {
            "unblock" => Some(Action::Unblock),
            "stop_receiving" => Some(Action::StopReceiving),
            "proceed" => Some(Action::Proceed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Unblock => "unblock",
            Action::StopReceiving => "stop_receiving",
            Action::Proceed => "proceed",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReadResult
// ---------------------------------------------------------------------------

/// Per-read alignment storage. Nascent reads rarely map to more than a couple
/// of loci, so keep the common case off the heap.
pub type Alignments = SmallVec<[Alignment; 2]>;

/// The progressively-filled record for one analysed chunk.
///
/// The caller plugin sets identity, `barcode`, `seq`, and `quality`; the
/// aligner fills `alignment_data`; the decision engine sets `decision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub channel: u32,
    pub read_number: u32,
    pub read_id: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub seq: String,
    #[serde(default)]
    pub quality: Option<String>,
    /// Opaque extra data the caller wants to hand to the aligner.
    #[serde(default)]
    pub basecall_data: Option<serde_json::Value>,
    #[serde(default)]
    pub alignment_data: Alignments,
    #[serde(default = "default_decision")]
    pub decision: Decision,
}

fn default_decision() -> Decision {
    Decision::NoSeq
}

impl ReadResult {
    /// A result carrying only read identity, with no sequence.
    pub fn empty(channel: u32, read_number: u32, read_id: String) -> Self {
        Self {
            channel,
            read_number,
            read_id,
            barcode: None,
            seq: String::new(),
            quality: None,
            basecall_data: None,
            alignment_data: SmallVec::new(),
            decision: Decision::NoSeq,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn aln(strand: Strand, r_st: u64, r_en: u64) -> Alignment {
        Alignment {
            contig: "chr1".into(),
            strand,
            r_st,
            r_en,
            mapq: 60,
        }
    }

    #[test]
    fn test_query_coord_forward_is_r_en() {
        assert_eq!(aln(Strand::Forward, 100, 500).query_coord(), 500);
    }

    #[test]
    fn test_query_coord_reverse_is_r_st() {
        assert_eq!(aln(Strand::Reverse, 100, 500).query_coord(), 100);
    }

    #[test]
    fn test_action_tokens() {
        assert_eq!(Action::parse("unblock"), Some(Action::Unblock));
        assert_eq!(Action::parse("stop_receiving"), Some(Action::StopReceiving));
        assert_eq!(Action::parse("proceed"), Some(Action::Proceed));
        assert_eq!(Action::parse("eject"), None);
        assert_eq!(Action::Unblock.as_str(), "unblock");
    }

    #[test]
    fn test_strand_parse() {
        assert_eq!(Strand::parse("+"), Some(Strand::Forward));
        assert_eq!(Strand::parse("-1"), Some(Strand::Reverse));
        assert_eq!(Strand::parse("fwd"), None);
        assert_eq!(Strand::Reverse.to_string(), "-");
    }

    #[test]
    fn test_empty_result_defaults_no_seq() {
        let r = ReadResult::empty(7, 42, "r-42".into());
        assert_eq!(r.decision, Decision::NoSeq);
        assert!(r.seq.is_empty());
        assert!(r.alignment_data.is_empty());
    }
}
