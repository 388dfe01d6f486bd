//! Instrument interface — the bidirectional stream the pipeline lives on.
//!
//! The sequencer pushes [`InstrumentEvent`]s (signal chunks, run-phase
//! changes, read-ended notices) and accepts batched [`ActionCommand`]s. The
//! [`InstrumentTransport`] trait is the seam: production runs speak
//! length-prefixed JSON frames over TCP ([`tcp::FramedTcpTransport`]), tests
//! and simulated runs use the in-memory [`playback::PlaybackTransport`].
//! Negotiating the vendor RPC itself is out of scope; anything that can
//! produce these events can drive the pipeline.

pub mod playback;
pub mod tcp;
pub mod wire;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Chunk;

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

/// The instrument's advertised run phase. Chunks are only analysed while
/// sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initialising,
    MuxScan,
    Sequencing,
    Paused,
    Complete,
}

impl RunPhase {
    pub fn is_sequencing(&self) -> bool {
        matches!(self, RunPhase::Sequencing)
    }

    /// Once the run is complete no further phases arrive.
    pub fn is_final(&self) -> bool {
        matches!(self, RunPhase::Complete)
    }
}

// ---------------------------------------------------------------------------
// InstrumentEvent / ActionCommand
// ---------------------------------------------------------------------------

/// One inbound message from the instrument stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstrumentEvent {
    Chunk(Chunk),
    Phase { phase: RunPhase },
    ReadEnded { channel: u32, read_number: u32 },
}

/// One outbound command. Commands are applied in submission order; the
/// pipeline makes no assumption about the sample offset they take effect at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ActionCommand {
    Unblock {
        channel: u32,
        read_number: u32,
        /// Seconds of reversed voltage.
        duration: f64,
    },
    StopReceiving { channel: u32, read_number: u32 },
}

impl ActionCommand {
    pub fn channel(&self) -> u32 {
        match self {
            ActionCommand::Unblock { channel, .. } => *channel,
            ActionCommand::StopReceiving { channel, .. } => *channel,
        }
    }

    pub fn read_number(&self) -> u32 {
        match self {
            ActionCommand::Unblock { read_number, .. } => *read_number,
            ActionCommand::StopReceiving { read_number, .. } => *read_number,
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentTransport
// ---------------------------------------------------------------------------

/// Blocking bidirectional stream to the instrument.
///
/// `next_event` and `send_actions` may be called from different threads; the
/// reader thread owns the inbound side, the dispatcher thread the outbound.
pub trait InstrumentTransport: Send + Sync {
    /// Channels on the connected flow cell.
    fn channel_count(&self) -> u32;

    /// The instrument's advertised chunk duration in seconds; the pipeline's
    /// per-batch latency budget.
    fn chunk_seconds(&self) -> f64;

    /// Block for the next event. `Ok(None)` means the stream ended
    /// gracefully; `Err` is a transport fault worth a reconnect attempt.
    fn next_event(&self) -> Result<Option<InstrumentEvent>>;

    /// Submit a batch of action commands.
    fn send_actions(&self, actions: &[ActionCommand]) -> Result<()>;

    /// Re-establish the stream after a fault. Transports that cannot
    /// reconnect return the fault unchanged.
    fn reconnect(&self) -> Result<()> {
        Err(crate::error::Error::TransportLost(
            "transport does not support reconnection".into(),
        ))
    }

    /// Human-readable endpoint summary for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialisation_tags() {
        let ev = InstrumentEvent::Phase {
            phase: RunPhase::MuxScan,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event":"phase""#));
        assert!(json.contains(r#""mux_scan""#));

        let cmd = ActionCommand::Unblock {
            channel: 3,
            read_number: 9,
            duration: 0.5,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""command":"unblock""#));
        let back: ActionCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_phase_predicates() {
        assert!(RunPhase::Sequencing.is_sequencing());
        assert!(!RunPhase::MuxScan.is_sequencing());
        assert!(RunPhase::Complete.is_final());
        assert!(!RunPhase::Paused.is_final());
    }
}
