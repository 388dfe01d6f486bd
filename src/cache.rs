//! Read-chunk cache — at most one in-flight chunk per channel.
//!
//! The instrument reader inserts chunks concurrently with the driver's
//! batched drain. Only the latest chunk for a read is kept: analysing the
//! newest slice of signal (rather than the accumulation) is what keeps the
//! per-batch latency under the instrument's chunk duration. A chunk for a
//! new read displaces whatever the channel was holding.
//!
//! Keyed mutual exclusion comes from `DashMap`'s sharding; every insert and
//! every per-channel removal is atomic, so a chunk arriving concurrently
//! with a drain lands in that batch or the next one, never nowhere.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::model::Chunk;

// ---------------------------------------------------------------------------
// CachedChunk
// ---------------------------------------------------------------------------

/// The pending entry for one channel: the latest chunk of the in-progress
/// read plus how many chunks arrived while the entry was pending.
#[derive(Debug, Clone)]
pub struct CachedChunk {
    pub chunk: Chunk,
    /// Chunks received for this (channel, read_number) since the entry was
    /// created, including this one. Draining starts a fresh entry, so
    /// consumers accumulate these per read.
    pub chunk_count: u32,
}

// ---------------------------------------------------------------------------
// ReadChunkCache
// ---------------------------------------------------------------------------

/// Bounded concurrent cache keyed by channel number.
pub struct ReadChunkCache {
    entries: DashMap<u32, CachedChunk>,
    capacity: u32,
    /// Chunks that replaced an older chunk of the same read.
    replaced: AtomicU64,
    /// Reads displaced unanalysed by a newer read on their channel.
    displaced: AtomicU64,
    /// Chunks rejected because the channel number was out of range.
    rejected: AtomicU64,
}

impl ReadChunkCache {
    /// Capacity is the flow cell's channel count; channels outside
    /// `[1, capacity]` are rejected.
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            replaced: AtomicU64::new(0),
            displaced: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Insert a chunk, replacing or displacing the channel's pending entry.
    pub fn insert(&self, chunk: Chunk) {
        if chunk.channel == 0 || chunk.channel > self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                channel = chunk.channel,
                capacity = self.capacity,
                "discarding chunk for out-of-range channel"
            );
            return;
        }
        match self.entries.entry(chunk.channel) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let entry = occ.get_mut();
                if entry.chunk.read_number == chunk.read_number {
                    // Same read: keep only the newest chunk.
                    entry.chunk = chunk;
                    entry.chunk_count += 1;
                    self.replaced.fetch_add(1, Ordering::Relaxed);
                } else {
                    // New read took over the pore; the old one is abandoned.
                    *entry = CachedChunk {
                        chunk,
                        chunk_count: 1,
                    };
                    self.displaced.fetch_add(1, Ordering::Relaxed);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(CachedChunk {
                    chunk,
                    chunk_count: 1,
                });
            }
        }
    }

    /// Remove and return every pending entry, ordered by channel.
    pub fn drain(&self) -> Vec<CachedChunk> {
        let mut channels: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
        channels.sort_unstable();
        let mut batch = Vec::with_capacity(channels.len());
        for ch in channels {
            // remove() is atomic per channel; an entry inserted after the
            // key snapshot simply waits for the next drain.
            if let Some((_, entry)) = self.entries.remove(&ch) {
                batch.push(entry);
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (replaced, displaced, rejected) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.replaced.load(Ordering::Relaxed),
            self.displaced.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
