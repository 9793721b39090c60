// Inbox — bounded queue of completed inbound messages
//
// Deduplication happens upstream in the delivery pipeline; everything that
// reaches the inbox is a first delivery. When capacity is hit, the oldest
// message is evicted to make room.

use super::{BoundedLog, StorageBackend, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Default number of inbound messages retained
pub const DEFAULT_INBOX_CAPACITY: usize = 128;

const INBOX_PREFIX: &[u8] = b"inbox:";

/// A completed inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender key (v2 sender id, or transport address for v1 senders)
    pub sender_id: String,
    pub message_id: u32,
    /// Reassembled payload bytes
    pub payload: Vec<u8>,
    /// When this was received (unix millis)
    pub received_at: u64,
}

pub struct InboxStore {
    log: Mutex<BoundedLog<InboundMessage>>,
}

impl InboxStore {
    pub fn open(backend: Arc<dyn StorageBackend>, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            log: Mutex::new(BoundedLog::open(backend, INBOX_PREFIX, capacity)?),
        })
    }

    pub fn push(&self, msg: InboundMessage) -> Result<(), StoreError> {
        debug!(
            "Inbox: message {} from {} ({} bytes)",
            msg.message_id,
            msg.sender_id,
            msg.payload.len()
        );
        let evicted = self.log.lock().push(msg)?;
        for old in evicted {
            debug!(
                "Inbox full, evicted message {} from {}",
                old.message_id, old.sender_id
            );
        }
        Ok(())
    }

    /// Get all stored messages, oldest first
    pub fn messages(&self) -> Vec<InboundMessage> {
        self.log.lock().to_vec()
    }

    pub fn messages_from(&self, sender_id: &str) -> Vec<InboundMessage> {
        self.log
            .lock()
            .iter()
            .filter(|m| m.sender_id == sender_id)
            .cloned()
            .collect()
    }

    /// Remove and return all messages, oldest first
    pub fn drain(&self) -> Result<Vec<InboundMessage>, StoreError> {
        self.log.lock().drain()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}
