// Ack store — bounded ring buffer of acknowledgements owed to senders
//
// Acks are served back to the sender on the ack stream, so each record also
// has a fixed 40-byte wire form: [36 bytes sender id, NUL padded][4 bytes msg id LE].

use super::{BoundedLog, StorageBackend, StoreError};
use crate::frame::SENDER_ID_LEN;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default number of acknowledgements retained
pub const DEFAULT_ACK_CAPACITY: usize = 256;

/// Size of one acknowledgement on the ack stream
pub const ACK_WIRE_LEN: usize = SENDER_ID_LEN + 4;

const ACK_PREFIX: &[u8] = b"ack:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Sender key (v2 sender id, or transport address for v1 senders)
    pub sender_id: String,
    pub message_id: u32,
    /// Unix millis
    pub acked_at: u64,
}

impl Acknowledgement {
    fn to_wire(&self) -> [u8; ACK_WIRE_LEN] {
        let mut buf = [0u8; ACK_WIRE_LEN];
        let id = self.sender_id.as_bytes();
        let n = id.len().min(SENDER_ID_LEN);
        buf[..n].copy_from_slice(&id[..n]);
        buf[SENDER_ID_LEN..].copy_from_slice(&self.message_id.to_le_bytes());
        buf
    }

    /// Decode an ack stream into `(sender_id, message_id)` pairs.
    /// A trailing partial record is ignored.
    pub fn decode_stream(data: &[u8]) -> Vec<(String, u32)> {
        data.chunks_exact(ACK_WIRE_LEN)
            .map(|record| {
                let id_field = &record[..SENDER_ID_LEN];
                let end = id_field.iter().position(|&b| b == 0).unwrap_or(SENDER_ID_LEN);
                let sender = String::from_utf8_lossy(&id_field[..end]).into_owned();
                let msg_id = u32::from_le_bytes([
                    record[SENDER_ID_LEN],
                    record[SENDER_ID_LEN + 1],
                    record[SENDER_ID_LEN + 2],
                    record[SENDER_ID_LEN + 3],
                ]);
                (sender, msg_id)
            })
            .collect()
    }
}

pub struct AckStore {
    log: Mutex<BoundedLog<Acknowledgement>>,
}

impl AckStore {
    pub fn open(backend: Arc<dyn StorageBackend>, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            log: Mutex::new(BoundedLog::open(backend, ACK_PREFIX, capacity)?),
        })
    }

    pub fn record(&self, sender_id: &str, message_id: u32, now: u64) -> Result<(), StoreError> {
        self.log.lock().push(Acknowledgement {
            sender_id: sender_id.to_string(),
            message_id,
            acked_at: now,
        })?;
        Ok(())
    }

    pub fn all(&self) -> Vec<Acknowledgement> {
        self.log.lock().to_vec()
    }

    pub fn for_sender(&self, sender_id: &str) -> Vec<Acknowledgement> {
        self.log
            .lock()
            .iter()
            .filter(|ack| ack.sender_id == sender_id)
            .cloned()
            .collect()
    }

    /// Ack stream contents for one sender
    pub fn stream_for(&self, sender_id: &str) -> Vec<u8> {
        self.for_sender(sender_id)
            .iter()
            .flat_map(|ack| ack.to_wire())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_ring_buffer_bound() {
        let store = AckStore::open(Arc::new(MemoryStorage::new()), 4).unwrap();
        for id in 0..10 {
            store.record("alice", id, 1000 + id as u64).unwrap();
            assert!(store.len() <= 4);
        }
        let ids: Vec<u32> = store.all().iter().map(|a| a.message_id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_stream_for_sender() {
        let store = AckStore::open(Arc::new(MemoryStorage::new()), 16).unwrap();
        store.record("alice", 1, 10).unwrap();
        store.record("bob", 2, 11).unwrap();
        store.record("alice", 3, 12).unwrap();

        let stream = store.stream_for("alice");
        assert_eq!(stream.len(), 2 * ACK_WIRE_LEN);
        assert_eq!(
            Acknowledgement::decode_stream(&stream),
            vec![("alice".to_string(), 1), ("alice".to_string(), 3)]
        );
        assert!(store.stream_for("carol").is_empty());
    }

    #[test]
    fn test_decode_ignores_partial_record() {
        let store = AckStore::open(Arc::new(MemoryStorage::new()), 16).unwrap();
        store.record("alice", 5, 10).unwrap();
        let mut stream = store.stream_for("alice");
        stream.extend_from_slice(&[1, 2, 3]);
        assert_eq!(Acknowledgement::decode_stream(&stream).len(), 1);
    }
}
