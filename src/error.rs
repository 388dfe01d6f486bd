//! Error taxonomy.
//!
//! Static configuration problems are collected into a single
//! [`Error::ConfigInvalid`] so a user sees every mistake in one pass, not one
//! per run. Dynamic failures (plugin startup, instrument transport) carry the
//! actionable cause in their message.

use std::fmt;

use thiserror::Error;

/// A single problem discovered while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    /// Dotted path of the offending field, e.g. `regions[0].single_on`.
    pub field: String,
    /// What is wrong and, where possible, what would be accepted.
    pub reason: String,
}

impl ConfigProblem {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// All problems found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigProblems(pub Vec<ConfigProblem>);

impl ConfigProblems {
    pub fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ConfigProblem::new(field, reason));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return `Ok(())` when no problems were recorded, otherwise the full list.
    pub fn into_result(self) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(self))
        }
    }
}

impl fmt::Display for ConfigProblems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len();
        writeln!(f, "{n} problem{}:", if n == 1 { "" } else { "s" })?;
        for p in &self.0 {
            writeln!(f, "  - {p}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or semantically invalid experiment configuration.
    /// Carries every problem discovered, not just the first.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(ConfigProblems),

    /// A plugin failed its startup validation (socket unreachable, reference
    /// missing, wrong file extension, ...). Fatal at startup.
    #[error("plugin '{plugin}' failed to initialise: {reason}")]
    PluginInit { plugin: String, reason: String },

    /// The instrument or basecaller stream closed unexpectedly.
    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn plugin_init(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginInit {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problems_accumulate() {
        let mut probs = ConfigProblems::default();
        probs.push("regions[0].single_on", "unknown action token 'explode'");
        probs.push("regions[0].min_chunks", "min_chunks (4) exceeds max_chunks (2)");
        let err = probs.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2 problems"));
        assert!(msg.contains("explode"));
        assert!(msg.contains("min_chunks (4)"));
    }

    #[test]
    fn test_empty_problems_ok() {
        assert!(ConfigProblems::default().into_result().is_ok());
    }
}
