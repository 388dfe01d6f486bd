//! Experiment configuration — the TOML description of an adaptive-sampling
//! run, validated into immutable lookup structures for the hot path.
//!
//! Loading is two-phase: serde deserialises a lenient raw form, then
//! validation walks it and collects every problem (missing keys, bad action
//! tokens, unmergeable targets, indivisible region splits) into one
//! [`Error::ConfigInvalid`] report. Only a clean pass yields a [`Conf`].
//!
//! A run holds its `Conf` behind a [`ConfHandle`]; reload is a full
//! replacement that swaps the shared handle atomically.

pub mod flowcell;
pub mod targets;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigProblems, Error, Result};
use crate::model::{Action, Decision};
use flowcell::{FlowcellLayout, SplitAxis};
use targets::{TargetSpec, Targets};

/// Barcode names that must be configured whenever barcoding is enabled.
pub const REQUIRED_BARCODES: [&str; 2] = ["classified", "unclassified"];

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// The unit of policy: a region of the flow cell or a barcode, with its
/// targets and the action to take for every classification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub name: String,
    /// Control conditions classify but always dispatch `proceed`.
    pub control: bool,
    pub min_chunks: u32,
    pub max_chunks: u32,
    pub targets: Targets,
    pub single_on: Action,
    pub single_off: Action,
    pub multi_on: Action,
    pub multi_off: Action,
    pub no_map: Action,
    pub no_seq: Action,
    pub above_max_chunks: Action,
    pub below_min_chunks: Action,
}

impl Condition {
    /// The action this condition's table assigns to a decision.
    pub fn action_for(&self, decision: Decision) -> Action {
        match decision {
            Decision::SingleOn => self.single_on,
            Decision::SingleOff => self.single_off,
            Decision::MultiOn => self.multi_on,
            Decision::MultiOff => self.multi_off,
            Decision::NoMap => self.no_map,
            Decision::NoSeq => self.no_seq,
            Decision::AboveMaxChunks => self.above_max_chunks,
            Decision::BelowMinChunks => self.below_min_chunks,
        }
    }

    /// Group the outcomes by action, for the describe output.
    pub fn describe_policy(&self) -> String {
        let mut by_action: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for d in [
            Decision::SingleOn,
            Decision::SingleOff,
            Decision::MultiOn,
            Decision::MultiOff,
            Decision::NoMap,
            Decision::NoSeq,
            Decision::BelowMinChunks,
            Decision::AboveMaxChunks,
        ] {
            by_action
                .entry(self.action_for(d).as_str())
                .or_default()
                .push(d.as_str());
        }
        let mut out = String::new();
        for (action, outcomes) in by_action {
            let _ = writeln!(out, "  {action}: {}", outcomes.join(", "));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// PluginSettings
// ---------------------------------------------------------------------------

/// One plugin selector: `[caller_settings.<name>]` or
/// `[mapper_settings.<name>]`, with its options passed through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSettings {
    pub name: String,
    pub parameters: toml::Table,
}

impl PluginSettings {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.parameters.get(key).and_then(|v| v.as_integer())
    }
}

// ---------------------------------------------------------------------------
// Conf
// ---------------------------------------------------------------------------

/// A validated experiment configuration. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    pub channels: u32,
    pub split_axis: SplitAxis,
    pub caller_settings: PluginSettings,
    pub mapper_settings: PluginSettings,
    pub regions: Vec<Condition>,
    pub barcodes: BTreeMap<String, Condition>,
    /// `channel_map[channel - 1]` = index into `regions`. Empty when the
    /// experiment is barcode-only.
    channel_map: Vec<usize>,
    layout: FlowcellLayout,
}

impl Conf {
    /// Load and validate a TOML file. `instrument_channels` is the flow
    /// cell's channel count as reported by the device; the TOML `channels`
    /// key overrides it.
    pub fn from_file(path: impl AsRef<Path>, instrument_channels: u32) -> Result<Conf> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(ConfigProblems(vec![crate::error::ConfigProblem::new(
                path.display().to_string(),
                format!("cannot read configuration: {e}"),
            )]))
        })?;
        Self::from_toml_str(&text, instrument_channels)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str, instrument_channels: u32) -> Result<Conf> {
        let raw: RawConf = toml::from_str(text).map_err(|e| {
            Error::ConfigInvalid(ConfigProblems(vec![crate::error::ConfigProblem::new(
                "toml", e.to_string(),
            )]))
        })?;
        raw.validate(instrument_channels)
    }

    /// Serialise back to TOML. Loading the output yields an equal `Conf`.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(&RawConf::from_conf(self)).expect("conf serialises")
    }

    /// The region for a channel, when regions are configured.
    pub fn region_for(&self, channel: u32) -> Option<&Condition> {
        if self.regions.is_empty() {
            return None;
        }
        let idx = (channel as usize).checked_sub(1)?;
        let region_idx = self.channel_map.get(idx).copied()?;
        self.regions.get(region_idx)
    }

    /// The barcode condition for a reported barcode name. Names without
    /// their own table fall back to `classified`.
    pub fn barcode_for(&self, barcode: Option<&str>) -> Option<&Condition> {
        let name = barcode?;
        if self.barcodes.is_empty() {
            return None;
        }
        self.barcodes
            .get(name)
            .or_else(|| self.barcodes.get("classified"))
    }

    /// The condition governing a result: a barcode condition when barcoding
    /// is enabled and a barcode was reported, otherwise the channel's
    /// region. Total over all inputs.
    pub fn condition_for(&self, channel: u32, barcode: Option<&str>) -> &Condition {
        if let Some(b) = self.barcode_for(barcode) {
            return b;
        }
        if !self.regions.is_empty() {
            // Channels outside the layout (including 0) fall back to the
            // first region so the map stays total.
            if let Some(r) = self.region_for(channel) {
                return r;
            }
            return &self.regions[0];
        }
        // Barcode-only experiment and no barcode reported: treat as
        // unclassified. Validation guarantees the table exists.
        self.barcodes
            .get("unclassified")
            .or_else(|| self.barcodes.values().next())
            .expect("validated configuration has at least one condition")
    }

    /// Every condition, regions first.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.regions.iter().chain(self.barcodes.values())
    }

    /// Check every referenced target contig against the reference inventory.
    /// Duplicate names in the inventory are an error in their own right.
    pub fn check_reference_contigs<S: AsRef<str>>(&self, reference: &[S]) -> Result<()> {
        let mut problems = ConfigProblems::default();
        let mut seen = std::collections::HashSet::new();
        for name in reference {
            if !seen.insert(name.as_ref()) {
                problems.push(
                    "reference",
                    format!("duplicate sequence name {:?} in reference", name.as_ref()),
                );
            }
        }
        for cond in self.conditions() {
            for contig in cond.targets.contigs() {
                if !seen.contains(contig) {
                    problems.push(
                        format!("condition '{}'", cond.name),
                        format!("target contig {contig:?} not present in the reference"),
                    );
                }
            }
        }
        problems.into_result()
    }

    /// Human-readable summary: barcodes, then each region with an ASCII
    /// sketch of the channels it covers.
    pub fn describe(&self) -> String {
        let mut out = String::from("Configuration:\n");
        if !self.barcodes.is_empty() {
            let _ = writeln!(
                out,
                "{} barcode condition(s) (including classified and unclassified):",
                self.barcodes.len()
            );
            for b in self.barcodes.values() {
                let _ = writeln!(out, "Barcode {} (control={})", b.name, b.control);
                out.push_str(&b.describe_policy());
            }
        }
        for (idx, region) in self.regions.iter().enumerate() {
            let _ = writeln!(
                out,
                "Region {} (control={}) applies to channels marked '#':",
                region.name, region.control
            );
            out.push_str(&self.layout.draw_region(&self.channel_map, idx));
            out.push_str(&region.describe_policy());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ConfHandle
// ---------------------------------------------------------------------------

/// Shared, atomically swappable configuration handle. Readers take a cheap
/// `Arc` snapshot; reload replaces the whole configuration at once.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<RwLock<Arc<Conf>>>,
}

impl ConfHandle {
    pub fn new(conf: Conf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(conf))),
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> Arc<Conf> {
        self.inner.read().expect("conf lock poisoned").clone()
    }

    /// Replace the configuration wholesale.
    pub fn swap(&self, conf: Conf) {
        *self.inner.write().expect("conf lock poisoned") = Arc::new(conf);
    }
}

// ---------------------------------------------------------------------------
// Raw (serde) form and validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    split_axis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caller_settings: Option<BTreeMap<String, toml::Table>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mapper_settings: Option<BTreeMap<String, toml::Table>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    regions: Vec<RawCondition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    barcodes: BTreeMap<String, RawCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    control: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_chunks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_chunks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    targets: Option<TargetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    single_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    single_off: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multi_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multi_off: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    no_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    no_seq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    above_max_chunks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    below_min_chunks: Option<String>,
}

impl RawConf {
    fn validate(self, instrument_channels: u32) -> Result<Conf> {
        let mut problems = ConfigProblems::default();

        let split_axis = match self.split_axis {
            None => SplitAxis::default(),
            Some(i) => SplitAxis::from_index(i).unwrap_or_else(|| {
                problems.push("split_axis", format!("must be 0 or 1, found {i}"));
                SplitAxis::default()
            }),
        };

        let channels = self.channels.unwrap_or(instrument_channels);
        if channels == 0 {
            problems.push("channels", "channel count must be positive");
        }

        let caller_settings =
            take_plugin(self.caller_settings, "caller_settings", &mut problems);
        let mapper_settings =
            take_plugin(self.mapper_settings, "mapper_settings", &mut problems);

        let regions: Vec<Condition> = self
            .regions
            .iter()
            .enumerate()
            .map(|(i, raw)| raw.validate(&format!("regions[{i}]"), &mut problems))
            .collect();
        let barcodes: BTreeMap<String, Condition> = self
            .barcodes
            .iter()
            .map(|(name, raw)| {
                let mut cond = raw.validate(&format!("barcodes.{name}"), &mut problems);
                if cond.name.is_empty() {
                    cond.name = name.clone();
                }
                (name.clone(), cond)
            })
            .collect();

        if barcodes.is_empty() {
            if regions.is_empty() {
                problems.push(
                    "regions",
                    "at least one region is required when barcoding is disabled",
                );
            }
        } else {
            for required in REQUIRED_BARCODES {
                if !barcodes.contains_key(required) {
                    problems.push(
                        format!("barcodes.{required}"),
                        "required whenever any barcode conditions are configured",
                    );
                }
            }
        }

        let layout = match FlowcellLayout::for_channel_count(channels.max(1) as usize) {
            Ok(l) => l,
            Err(reason) => {
                problems.push("channels", reason);
                FlowcellLayout::for_channel_count(512).expect("fallback layout")
            }
        };
        let channel_map = if regions.is_empty() {
            Vec::new()
        } else {
            match layout.region_map(regions.len(), split_axis) {
                Ok(map) => map,
                Err(errs) => {
                    problems.0.extend(errs.0);
                    Vec::new()
                }
            }
        };

        problems.into_result()?;

        Ok(Conf {
            channels,
            split_axis,
            caller_settings: caller_settings.expect("validated"),
            mapper_settings: mapper_settings.expect("validated"),
            regions,
            barcodes,
            channel_map,
            layout,
        })
    }

    fn from_conf(conf: &Conf) -> RawConf {
        let plugin = |p: &PluginSettings| {
            let mut m = BTreeMap::new();
            m.insert(p.name.clone(), p.parameters.clone());
            Some(m)
        };
        RawConf {
            split_axis: Some(conf.split_axis.index()),
            channels: Some(conf.channels),
            caller_settings: plugin(&conf.caller_settings),
            mapper_settings: plugin(&conf.mapper_settings),
            regions: conf.regions.iter().map(RawCondition::from_condition).collect(),
            barcodes: conf
                .barcodes
                .iter()
                .map(|(k, v)| (k.clone(), RawCondition::from_condition(v)))
                .collect(),
        }
    }
}

/// Exactly one `<plugin>` sub-table must be present.
fn take_plugin(
    table: Option<BTreeMap<String, toml::Table>>,
    field: &str,
    problems: &mut ConfigProblems,
) -> Option<PluginSettings> {
    let Some(table) = table else {
        problems.push(field, "exactly one plugin sub-table is required");
        return None;
    };
    if table.len() != 1 {
        problems.push(
            field,
            format!("exactly one plugin sub-table is required, found {}", table.len()),
        );
        return None;
    }
    let (name, parameters) = table.into_iter().next().expect("one entry");
    Some(PluginSettings { name, parameters })
}

impl RawCondition {
    fn validate(&self, field: &str, problems: &mut ConfigProblems) -> Condition {
        let mut require_action = |key: &str, value: &Option<String>| -> Action {
            match value {
                None => {
                    problems.push(format!("{field}.{key}"), "required action is missing");
                    Action::Proceed
                }
                Some(token) => Action::parse(token).unwrap_or_else(|| {
                    problems.push(
                        format!("{field}.{key}"),
                        format!(
                            "unknown action token {token:?}, expected unblock, stop_receiving, or proceed"
                        ),
                    );
                    Action::Proceed
                }),
            }
        };

        let single_on = require_action("single_on", &self.single_on);
        let single_off = require_action("single_off", &self.single_off);
        let multi_on = require_action("multi_on", &self.multi_on);
        let multi_off = require_action("multi_off", &self.multi_off);
        let no_map = require_action("no_map", &self.no_map);
        let no_seq = require_action("no_seq", &self.no_seq);
        let above_max_chunks = match &self.above_max_chunks {
            None => Action::Unblock,
            some => require_action("above_max_chunks", some),
        };
        let below_min_chunks = match &self.below_min_chunks {
            None => Action::Proceed,
            some => require_action("below_min_chunks", some),
        };

        let name = match &self.name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => {
                // Barcode tables inherit their table key; regions must name
                // themselves.
                if field.starts_with("regions") {
                    problems.push(format!("{field}.name"), "required name is missing");
                }
                String::new()
            }
        };

        let mut require_count = |key: &str, value: Option<i64>| -> u32 {
            match value {
                None => {
                    problems.push(format!("{field}.{key}"), "required count is missing");
                    0
                }
                Some(n) if n < 0 => {
                    problems.push(format!("{field}.{key}"), format!("must be >= 0, found {n}"));
                    0
                }
                Some(n) => n as u32,
            }
        };
        let min_chunks = require_count("min_chunks", self.min_chunks);
        let max_chunks = require_count("max_chunks", self.max_chunks);
        if min_chunks > max_chunks {
            problems.push(
                format!("{field}.min_chunks"),
                format!("min_chunks ({min_chunks}) exceeds max_chunks ({max_chunks})"),
            );
        }

        let targets = match &self.targets {
            None => {
                problems.push(format!("{field}.targets"), "required targets are missing");
                Targets::default()
            }
            Some(spec) => Targets::from_spec(spec.clone(), &format!("{field}.targets"), problems),
        };

        Condition {
            name,
            control: self.control.unwrap_or(false),
            min_chunks,
            max_chunks,
            targets,
            single_on,
            single_off,
            multi_on,
            multi_off,
            no_map,
            no_seq,
            above_max_chunks,
            below_min_chunks,
        }
    }

    fn from_condition(cond: &Condition) -> RawCondition {
        RawCondition {
            name: Some(cond.name.clone()),
            control: Some(cond.control),
            min_chunks: Some(cond.min_chunks as i64),
            max_chunks: Some(cond.max_chunks as i64),
            targets: Some(cond.targets.spec().clone()),
            single_on: Some(cond.single_on.as_str().into()),
            single_off: Some(cond.single_off.as_str().into()),
            multi_on: Some(cond.multi_on.as_str().into()),
            multi_off: Some(cond.multi_off.as_str().into()),
            no_map: Some(cond.no_map.as_str().into()),
            no_seq: Some(cond.no_seq.as_str().into()),
            above_max_chunks: Some(cond.above_max_chunks.as_str().into()),
            below_min_chunks: Some(cond.below_min_chunks.as_str().into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
