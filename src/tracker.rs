//! Action tracker — per-read chunk counts and terminal-state dedup.
//!
//! The instrument must see at most one `unblock` and at most one
//! `stop_receiving` per read; whichever lands first wins and every later
//! action for that read is suppressed, including max-chunks unblocks. The
//! tracker is written only by the pipeline driver.
//!
//! Channels host one read at a time and read numbers only grow, so the live
//! state is a single slot per channel. The terminal marker for the most
//! recently finalised read is kept beside the slot so late chunks of a
//! finalised read are recognised and discarded; markers are swept once their
//! TTL expires.

use std::time::{Duration, Instant};

use crate::model::{Action, ReadResult};

/// Terminal state of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    UnblockSent,
    StopReceivingSent,
}

/// An action the driver should dispatch for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Unblock { channel: u32, read_number: u32 },
    StopReceiving { channel: u32, read_number: u32 },
}

#[derive(Debug, Clone, Copy)]
struct LiveRead {
    read_number: u32,
    chunk_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct TerminalMark {
    read_number: u32,
    state: Terminal,
    at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelSlot {
    live: Option<LiveRead>,
    terminal: Option<TerminalMark>,
}

// ---------------------------------------------------------------------------
// ActionTracker
// ---------------------------------------------------------------------------

pub struct ActionTracker {
    slots: Vec<ChannelSlot>,
    ttl: Duration,
}

impl ActionTracker {
    pub fn new(channels: u32) -> Self {
        Self::with_ttl(channels, Duration::from_secs(120))
    }

    pub fn with_ttl(channels: u32, ttl: Duration) -> Self {
        Self {
            slots: vec![ChannelSlot::default(); channels as usize + 1],
            ttl,
        }
    }

    fn slot_mut(&mut self, channel: u32) -> Option<&mut ChannelSlot> {
        self.slots.get_mut(channel as usize)
    }

    /// Record chunk arrivals observed for a read at drain time. The cache
    /// entry counts arrivals since the previous drain, so counts accumulate
    /// here across batches. A new read number clears the channel's previous
    /// live state.
    pub fn note_chunks(&mut self, channel: u32, read_number: u32, chunk_count: u32) {
        let Some(slot) = self.slot_mut(channel) else {
            return;
        };
        match &mut slot.live {
            Some(live) if live.read_number == read_number => {
                live.chunk_count = live.chunk_count.saturating_add(chunk_count);
            }
            other => {
                *other = Some(LiveRead {
                    read_number,
                    chunk_count,
                });
            }
        }
    }

    /// Chunks seen so far for a read; 0 for unknown reads.
    pub fn chunk_count(&self, channel: u32, read_number: u32) -> u32 {
        self.slots
            .get(channel as usize)
            .and_then(|s| s.live)
            .filter(|l| l.read_number == read_number)
            .map(|l| l.chunk_count)
            .unwrap_or(0)
    }

    /// Has a terminal action already been issued for this read?
    pub fn is_terminal(&self, channel: u32, read_number: u32) -> bool {
        self.slots
            .get(channel as usize)
            .and_then(|s| s.terminal)
            .map(|t| t.read_number == read_number)
            .unwrap_or(false)
    }

    /// Convert a decided result into at most one dispatchable action.
    ///
    /// `proceed` never emits; a read that already holds a terminal marker
    /// never emits again, whatever the new action would have been.
    pub fn record(&mut self, result: &ReadResult, action: Action) -> Option<ActionOutcome> {
        if self.is_terminal(result.channel, result.read_number) {
            return None;
        }
        let state = match action {
            Action::Proceed => return None,
            Action::Unblock => Terminal::UnblockSent,
            Action::StopReceiving => Terminal::StopReceivingSent,
        };
        let slot = self.slot_mut(result.channel)?;
        slot.terminal = Some(TerminalMark {
            read_number: result.read_number,
            state,
            at: Instant::now(),
        });
        Some(match state {
            Terminal::UnblockSent => ActionOutcome::Unblock {
                channel: result.channel,
                read_number: result.read_number,
            },
            Terminal::StopReceivingSent => ActionOutcome::StopReceiving {
                channel: result.channel,
                read_number: result.read_number,
            },
        })
    }

    /// The instrument reported this read finished: drop the live counter but
    /// keep the terminal marker so straggler chunks stay suppressed.
    pub fn read_ended(&mut self, channel: u32, read_number: u32) {
        if let Some(slot) = self.slot_mut(channel) {
            if slot.live.map(|l| l.read_number) == Some(read_number) {
                slot.live = None;
            }
        }
    }

    /// Sweep expired terminal markers. Returns how many were evicted.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut evicted = 0;
        for slot in &mut self.slots {
            if let Some(mark) = slot.terminal {
                if now.duration_since(mark.at) > ttl {
                    slot.terminal = None;
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
