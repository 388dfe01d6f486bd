//! Target index — merged genomic intervals per (contig, strand).
//!
//! Targets come from an inline array of `contig` / `contig,start,end,strand`
//! strings, a BED file (six columns required), or a headerless CSV file.
//! Overlapping intervals on the same (contig, strand) are merged at load time
//! so [`Targets::check_coord`] is a plain binary search over sorted,
//! disjoint, half-open intervals.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigProblems;
use crate::model::Strand;

// ---------------------------------------------------------------------------
// TargetSpec
// ---------------------------------------------------------------------------

/// The raw `targets` value as written in the experiment TOML: either an
/// inline array of target strings or a path to a BED/CSV file.
///
/// Kept alongside the parsed index so a loaded configuration serialises back
/// to exactly what the user wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    File(PathBuf),
    Inline(Vec<String>),
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::Inline(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One target interval, for iteration and describe output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInterval {
    pub contig: String,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ContigTargets {
    /// Whole-contig marker; takes precedence over any interval query.
    whole: bool,
    /// Sorted, disjoint, half-open `[start, end)` intervals.
    intervals: Vec<(u64, u64)>,
}

/// The queryable target index for one condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Targets {
    spec: TargetSpec,
    by_strand: [HashMap<String, ContigTargets>; 2],
}

fn strand_slot(strand: Strand) -> usize {
    match strand {
        Strand::Forward => 0,
        Strand::Reverse => 1,
    }
}

impl Targets {
    /// Build the index from a raw spec. Problems (unreadable file, malformed
    /// rows) are appended to `problems` under `field`; a partially parsed
    /// index is still returned so validation can keep going.
    pub fn from_spec(spec: TargetSpec, field: &str, problems: &mut ConfigProblems) -> Targets {
        let mut targets = Targets {
            spec: spec.clone(),
            by_strand: Default::default(),
        };
        match spec {
            TargetSpec::Inline(lines) => {
                for (i, line) in lines.iter().enumerate() {
                    if let Err(reason) = targets.add_row(&split_row(line, ',')) {
                        problems.push(format!("{field}[{i}]"), reason);
                    }
                }
            }
            TargetSpec::File(path) => targets.load_file(&path, field, problems),
        }
        for per_contig in targets.by_strand.iter_mut() {
            for ct in per_contig.values_mut() {
                merge_intervals(&mut ct.intervals);
            }
        }
        targets
    }

    fn load_file(&mut self, path: &Path, field: &str, problems: &mut ConfigProblems) {
        let is_bed = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("bed"))
            .unwrap_or(false);
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                problems.push(field, format!("cannot read {}: {e}", path.display()));
                return;
            }
        };
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let result = if is_bed {
                let cols = split_row(line, '\t');
                if cols.len() != 6 {
                    Err(format!("expected 6 tab-separated columns, found {}", cols.len()))
                } else {
                    // BED: contig start end name score strand
                    self.add_parsed(
                        &cols[0],
                        Some((cols[1].as_str(), cols[2].as_str(), cols[5].as_str())),
                    )
                }
            } else {
                self.add_row(&split_row(line, ','))
            };
            if let Err(reason) = result {
                problems.push(
                    field,
                    format!("{} line {}: {reason}", path.display(), lineno + 1),
                );
            }
        }
    }

    /// Add one CSV-style row: `contig` or `contig,start,end,strand`.
    fn add_row(&mut self, cols: &[String]) -> Result<(), String> {
        match cols.len() {
            1 => self.add_parsed(&cols[0], None),
            4 => self.add_parsed(
                &cols[0],
                Some((cols[1].as_str(), cols[2].as_str(), cols[3].as_str())),
            ),
            n => Err(format!(
                "expected 'contig' or 'contig,start,end,strand', found {n} fields"
            )),
        }
    }

    fn add_parsed(
        &mut self,
        contig: &str,
        coords: Option<(&str, &str, &str)>,
    ) -> Result<(), String> {
        if contig.is_empty() {
            return Err("empty contig name".into());
        }
        match coords {
            None => {
                // Whole contig, both strands.
                for strand in [Strand::Forward, Strand::Reverse] {
                    self.by_strand[strand_slot(strand)]
                        .entry(contig.to_string())
                        .or_default()
                        .whole = true;
                }
                Ok(())
            }
            Some((st, en, strand)) => {
                let start: u64 = st
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid start coordinate {st:?}"))?;
                let end: u64 = en
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid end coordinate {en:?}"))?;
                if end <= start {
                    return Err(format!("end ({end}) must be greater than start ({start})"));
                }
                let strand = Strand::parse(strand.trim())
                    .ok_or_else(|| format!("invalid strand {strand:?}, expected '+' or '-'"))?;
                self.by_strand[strand_slot(strand)]
                    .entry(contig.to_string())
                    .or_default()
                    .intervals
                    .push((start, end));
                Ok(())
            }
        }
    }

    /// Does `coord` on (contig, strand) fall inside any target?
    ///
    /// Unknown contigs are off-target, never an error.
    pub fn check_coord(&self, contig: &str, strand: Strand, coord: u64) -> bool {
        let Some(ct) = self.by_strand[strand_slot(strand)].get(contig) else {
            return false;
        };
        if ct.whole {
            return true;
        }
        // Rightmost interval starting at or before coord; intervals are
        // disjoint and sorted, so it is the only candidate.
        let idx = ct.intervals.partition_point(|&(start, _)| start <= coord);
        if idx == 0 {
            return false;
        }
        let (_, end) = ct.intervals[idx - 1];
        coord < end
    }

    /// The raw spec this index was built from.
    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    /// Every contig referenced on either strand, deduplicated.
    pub fn contigs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .by_strand
            .iter()
            .flat_map(|m| m.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Iterate the merged intervals. Whole-contig markers yield a single
    /// `[0, u64::MAX)` interval.
    pub fn iter(&self) -> impl Iterator<Item = TargetInterval> + '_ {
        [Strand::Forward, Strand::Reverse]
            .into_iter()
            .flat_map(move |strand| {
                self.by_strand[strand_slot(strand)]
                    .iter()
                    .flat_map(move |(contig, ct)| {
                        let whole = ct
                            .whole
                            .then(|| (0u64, u64::MAX))
                            .into_iter()
                            .chain(ct.intervals.iter().copied());
                        whole.map(move |(start, end)| TargetInterval {
                            contig: contig.clone(),
                            start,
                            end,
                            strand,
                        })
                    })
            })
    }

    pub fn is_empty(&self) -> bool {
        self.by_strand
            .iter()
            .all(|m| m.values().all(|ct| !ct.whole && ct.intervals.is_empty()))
    }
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.iter().count();
        write!(f, "{n} target interval{}", if n == 1 { "" } else { "s" })
    }
}

/// Merge overlapping or adjacent intervals in place. Input order is
/// arbitrary; output is sorted and disjoint.
fn merge_intervals(intervals: &mut Vec<(u64, u64)>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for &(start, end) in intervals.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    *intervals = merged;
}

fn split_row(line: &str, delim: char) -> Vec<String> {
    line.split(delim).map(|s| s.trim().to_string()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
