//! Caller and aligner plugins.
//!
//! Basecalling and alignment are external capabilities behind two small
//! traits; the pipeline only ever sees lazy streams of [`ReadResult`]s. A
//! registry maps the configuration's plugin names to constructors:
//! callers `real` and `no_op`, aligners `mappy`, `mappy_rs`, and `no_op`.

pub mod mappy;
pub mod no_op;
pub mod real;

use crate::config::PluginSettings;
use crate::error::{ConfigProblems, Error, Result};
use crate::model::{Chunk, ReadResult};

/// Lazy, finite, non-restartable stream of results. Consumers must tolerate
/// any ordering; each result carries its own channel and read number.
pub type ResultStream<'a> = Box<dyn Iterator<Item = ReadResult> + 'a>;

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// A basecaller. One result is produced per input chunk, in any order.
///
/// A single read failing to basecall yields a result with an empty sequence;
/// a catastrophic failure (basecaller socket closed) is an `Err`, after
/// which the driver may try [`Caller::reconnect`] before giving up.
pub trait Caller {
    fn basecall<'a>(&'a mut self, chunks: &'a [Chunk]) -> Result<ResultStream<'a>>;

    /// Verify preconditions (connectivity, model availability) and fail fast
    /// with a descriptive error.
    fn validate(&self) -> Result<()>;

    /// Human-readable summary for logs.
    fn describe(&self) -> String;

    /// Re-establish a lost connection. Callers without a transport keep the
    /// default, which reports the capability is absent.
    fn reconnect(&mut self) -> Result<()> {
        Err(Error::TransportLost(
            "caller does not support reconnection".into(),
        ))
    }

    /// Scoped teardown; called on every exit path.
    fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// Aligner
// ---------------------------------------------------------------------------

/// An aligner. Attaches `alignment_data` (possibly empty) to each result.
pub trait Aligner {
    fn align<'a>(&'a mut self, results: ResultStream<'a>) -> ResultStream<'a>;

    fn validate(&self) -> Result<()>;

    /// Whether the aligner is ready to map. The pipeline idles until this
    /// turns true.
    fn initialised(&self) -> bool;

    fn describe(&self) -> String;

    /// Reference sequence names, when the backing index can enumerate them.
    /// Used to validate that every target contig exists.
    fn reference_contigs(&self) -> Option<Vec<String>> {
        None
    }

    fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub const BUILTIN_CALLERS: [&str; 2] = ["real", "no_op"];
pub const BUILTIN_ALIGNERS: [&str; 3] = ["mappy", "mappy_rs", "no_op"];

/// Construct the caller named by the configuration.
pub fn build_caller(settings: &PluginSettings) -> Result<Box<dyn Caller>> {
    match settings.name.as_str() {
        "no_op" => Ok(Box::new(no_op::NoOpCaller)),
        "real" => Ok(Box::new(real::SocketCaller::from_settings(settings)?)),
        other => Err(unknown_plugin("caller_settings", other, &BUILTIN_CALLERS)),
    }
}

/// Construct the aligner named by the configuration.
pub fn build_aligner(settings: &PluginSettings) -> Result<Box<dyn Aligner>> {
    match settings.name.as_str() {
        "no_op" => Ok(Box::new(no_op::NoOpAligner)),
        "mappy" => Ok(Box::new(mappy::MappyAligner::from_settings(settings)?)),
        "mappy_rs" => Ok(Box::new(mappy::ThreadedMappyAligner::from_settings(
            settings,
        )?)),
        other => Err(unknown_plugin("mapper_settings", other, &BUILTIN_ALIGNERS)),
    }
}

fn unknown_plugin(field: &str, name: &str, known: &[&str]) -> Error {
    let mut problems = ConfigProblems::default();
    problems.push(
        format!("{field}.{name}"),
        format!("unknown plugin, expected one of: {}", known.join(", ")),
    );
    Error::ConfigInvalid(problems)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
