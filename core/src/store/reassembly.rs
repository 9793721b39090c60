// Reassembly — per (sender, message id) accumulation of chunked messages
//
// Chunks must arrive strictly in order. A chunk declaring a different total
// length than the entry was opened with discards the entry; it opens a fresh
// one only when it is itself a first chunk.

use crate::frame::MessageFrame;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Entries untouched for this long are evicted
pub const DEFAULT_REASSEMBLY_IDLE_MS: u64 = 60 * 1000;

/// Largest message we are willing to buffer
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Offset did not match the next expected offset
    OutOfOrder { expected: u32, got: u32 },
    /// Declared total length exceeds the buffer cap
    TooLarge(u32),
    /// Chunk runs past the declared total length
    Overrun,
    /// Declared total length changed mid-transfer; the partial entry was
    /// discarded and this chunk cannot open a new one
    Restarted { previous: u32, declared: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk accepted, message not complete yet
    Progress { received: u32, total: u32 },
    /// Final chunk accepted; the entry has been removed
    Complete(Vec<u8>),
    /// Chunk ignored; existing state untouched except after `Restarted`
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct ReassemblyEntry {
    total_len: u32,
    buffer: Vec<u8>,
    next_offset: u32,
    last_updated: u64,
}

impl ReassemblyEntry {
    fn new(total_len: u32, now: u64) -> Self {
        Self {
            total_len,
            buffer: vec![0u8; total_len as usize],
            next_offset: 0,
            last_updated: now,
        }
    }

    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

pub struct ReassemblyStore {
    entries: HashMap<(String, u32), ReassemblyEntry>,
    idle_timeout_ms: u64,
}

impl ReassemblyStore {
    pub fn new(idle_timeout_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            idle_timeout_ms,
        }
    }

    /// Feed one message chunk from `sender`
    pub fn accept(&mut self, sender: &str, frame: &MessageFrame, now: u64) -> ChunkOutcome {
        self.evict_idle(now);

        if frame.total_len > MAX_MESSAGE_LEN {
            debug!(
                "Dropping chunk of message {} from {}: {} bytes declared",
                frame.msg_id, sender, frame.total_len
            );
            return ChunkOutcome::Dropped(DropReason::TooLarge(frame.total_len));
        }

        let key = (sender.to_string(), frame.msg_id);

        if let Some(previous) = self
            .entries
            .get(&key)
            .map(|e| e.total_len)
            .filter(|&total| total != frame.total_len)
        {
            self.entries.remove(&key);
            debug!(
                "Total length changed for {}:{} ({} -> {}), discarding partial message",
                sender, frame.msg_id, previous, frame.total_len
            );
            if frame.offset != 0 {
                return ChunkOutcome::Dropped(DropReason::Restarted {
                    previous,
                    declared: frame.total_len,
                });
            }
        }

        if !self.entries.contains_key(&key) {
            // A fresh attempt must start at the beginning
            if frame.offset != 0 {
                trace!(
                    "Out-of-order first chunk for {}:{} (offset {})",
                    sender,
                    frame.msg_id,
                    frame.offset
                );
                return ChunkOutcome::Dropped(DropReason::OutOfOrder {
                    expected: 0,
                    got: frame.offset,
                });
            }
            self.entries
                .insert(key.clone(), ReassemblyEntry::new(frame.total_len, now));
        }

        let Some(entry) = self.entries.get_mut(&key) else {
            return ChunkOutcome::Dropped(DropReason::OutOfOrder {
                expected: 0,
                got: frame.offset,
            });
        };

        if frame.offset != entry.next_offset {
            return ChunkOutcome::Dropped(DropReason::OutOfOrder {
                expected: entry.next_offset,
                got: frame.offset,
            });
        }

        let start = frame.offset as usize;
        let end = start + frame.payload.len();
        if end > entry.buffer.len() {
            return ChunkOutcome::Dropped(DropReason::Overrun);
        }
        entry.buffer[start..end].copy_from_slice(&frame.payload);
        entry.next_offset = end as u32;
        entry.last_updated = now;

        if entry.next_offset >= entry.total_len {
            let done = self.entries.remove(&key).map(|e| e.buffer).unwrap_or_default();
            debug!(
                "Reassembled message {} from {} ({} bytes)",
                frame.msg_id,
                sender,
                done.len()
            );
            ChunkOutcome::Complete(done)
        } else {
            ChunkOutcome::Progress {
                received: entry.next_offset,
                total: entry.total_len,
            }
        }
    }

    fn evict_idle(&mut self, now: u64) {
        let timeout = self.idle_timeout_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_updated) < timeout);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("Evicted {} idle reassembly entr(ies)", evicted);
        }
    }

    pub fn entry(&self, sender: &str, msg_id: u32) -> Option<&ReassemblyEntry> {
        self.entries.get(&(sender.to_string(), msg_id))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ReassemblyStore {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_IDLE_MS)
    }
}
