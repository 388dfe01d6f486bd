//! In-memory transport for tests and simulated (playback) runs.
//!
//! A [`PlaybackHandle`] scripts the instrument side: push chunks and phase
//! changes, then collect the actions the pipeline dispatched. Events flow
//! through a bounded crossbeam channel, so the reader thread blocks exactly
//! as it would on a live socket.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::Result;
use crate::instrument::{ActionCommand, InstrumentEvent, InstrumentTransport, RunPhase};
use crate::model::Chunk;

pub struct PlaybackTransport {
    channels: u32,
    chunk_seconds: f64,
    events: Receiver<InstrumentEvent>,
    actions: Sender<ActionCommand>,
}

/// The scripting side of a playback pair.
pub struct PlaybackHandle {
    events: Sender<InstrumentEvent>,
    actions: Receiver<ActionCommand>,
}

/// Create a connected (transport, handle) pair.
pub fn pair(channels: u32, chunk_seconds: f64) -> (PlaybackTransport, PlaybackHandle) {
    let (event_tx, event_rx) = channel::bounded(channels as usize * 4);
    let (action_tx, action_rx) = channel::unbounded();
    (
        PlaybackTransport {
            channels,
            chunk_seconds,
            events: event_rx,
            actions: action_tx,
        },
        PlaybackHandle {
            events: event_tx,
            actions: action_rx,
        },
    )
}

impl PlaybackHandle {
    pub fn send_chunk(&self, chunk: Chunk) {
        self.events.send(InstrumentEvent::Chunk(chunk)).ok();
    }

    pub fn set_phase(&self, phase: RunPhase) {
        self.events.send(InstrumentEvent::Phase { phase }).ok();
    }

    pub fn end_read(&self, channel: u32, read_number: u32) {
        self.events
            .send(InstrumentEvent::ReadEnded {
                channel,
                read_number,
            })
            .ok();
    }

    /// Close the instrument side; the pipeline sees a graceful end of
    /// stream.
    pub fn close(self) -> Receiver<ActionCommand> {
        drop(self.events);
        self.actions
    }

    /// Collect dispatched actions until `timeout` passes with none arriving.
    pub fn collect_actions(&self, timeout: Duration) -> Vec<ActionCommand> {
        let mut out = Vec::new();
        while let Ok(action) = self.actions.recv_timeout(timeout) {
            out.push(action);
        }
        out
    }

    /// Wait for exactly `n` actions or time out.
    pub fn wait_for_actions(&self, n: usize, timeout: Duration) -> Vec<ActionCommand> {
        let deadline = std::time::Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < n {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.actions.recv_timeout(remaining) {
                Ok(action) => out.push(action),
                Err(_) => break,
            }
        }
        out
    }
}

impl InstrumentTransport for PlaybackTransport {
    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn chunk_seconds(&self) -> f64 {
        self.chunk_seconds
    }

    fn next_event(&self) -> Result<Option<InstrumentEvent>> {
        match self.events.recv() {
            Ok(ev) => Ok(Some(ev)),
            // Script finished: graceful close.
            Err(channel::RecvError) => Ok(None),
        }
    }

    fn send_actions(&self, actions: &[ActionCommand]) -> Result<()> {
        for action in actions {
            // The scripting side may have stopped listening; that is fine.
            self.actions.send(action.clone()).ok();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "playback instrument ({} channels, {:.2}s chunks)",
            self.channels, self.chunk_seconds
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
