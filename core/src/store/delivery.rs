// Delivery pipeline — reassembly, dedup, ack and inbox behind one entry point
//
// Every inbound message chunk goes through `accept`. Completed messages are
// checked against the dedup cache: a fresh duplicate is acknowledged again but
// not re-delivered. A message only counts as seen once it is in the inbox.

use super::{
    AckStore, ChunkOutcome, DedupCache, DropReason, InboundMessage, InboxStore,
    ReassemblyStore, StorageBackend, StoreError,
};
use crate::frame::MessageFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

const DEDUP_PREFIX: &[u8] = b"dedup:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Chunk buffered, message not complete
    Partial { received: u32, total: u32 },
    /// Chunk ignored
    Dropped(DropReason),
    /// First delivery of a completed message
    Delivered(InboundMessage),
    /// Completed message already seen inside the dedup window
    Duplicate { sender_id: String, message_id: u32 },
}

struct Transient {
    reassembly: ReassemblyStore,
    dedup: DedupCache,
}

pub struct DeliveryPipeline {
    transient: Mutex<Transient>,
    acks: Arc<AckStore>,
    inbox: Arc<InboxStore>,
}

impl DeliveryPipeline {
    pub fn new(
        reassembly: ReassemblyStore,
        dedup: DedupCache,
        acks: Arc<AckStore>,
        inbox: Arc<InboxStore>,
    ) -> Self {
        Self {
            transient: Mutex::new(Transient { reassembly, dedup }),
            acks,
            inbox,
        }
    }

    /// Pipeline whose dedup records live in `backend` next to the ack and
    /// inbox logs
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        acks: Arc<AckStore>,
        inbox: Arc<InboxStore>,
        reassembly_idle_ms: u64,
        dedup_ttl_ms: u64,
        now: u64,
    ) -> Result<Self, StoreError> {
        let dedup = DedupCache::open(backend, DEDUP_PREFIX, dedup_ttl_ms, now)?;
        Ok(Self::new(
            ReassemblyStore::new(reassembly_idle_ms),
            dedup,
            acks,
            inbox,
        ))
    }

    pub fn accept(
        &self,
        sender_id: &str,
        frame: &MessageFrame,
        now: u64,
    ) -> Result<DeliveryOutcome, StoreError> {
        let mut transient = self.transient.lock();

        let payload = match transient.reassembly.accept(sender_id, frame, now) {
            ChunkOutcome::Progress { received, total } => {
                return Ok(DeliveryOutcome::Partial { received, total })
            }
            ChunkOutcome::Dropped(reason) => {
                debug!(
                    "Dropped chunk of message {} from {}: {:?}",
                    frame.msg_id, sender_id, reason
                );
                return Ok(DeliveryOutcome::Dropped(reason));
            }
            ChunkOutcome::Complete(payload) => payload,
        };

        let key = DedupCache::message_key(sender_id, frame.msg_id);
        if transient.dedup.is_fresh(&key, now) {
            drop(transient);
            self.acks.record(sender_id, frame.msg_id, now)?;
            debug!(
                "Duplicate message {} from {}, acknowledged only",
                frame.msg_id, sender_id
            );
            return Ok(DeliveryOutcome::Duplicate {
                sender_id: sender_id.to_string(),
                message_id: frame.msg_id,
            });
        }

        let message = InboundMessage {
            sender_id: sender_id.to_string(),
            message_id: frame.msg_id,
            payload,
            received_at: now,
        };
        self.inbox.push(message.clone())?;
        transient.dedup.insert(&key, now)?;
        drop(transient);

        self.acks.record(sender_id, frame.msg_id, now)?;
        info!(
            "Delivered message {} from {} ({} bytes)",
            message.message_id,
            message.sender_id,
            message.payload.len()
        );
        Ok(DeliveryOutcome::Delivered(message))
    }

    /// Forget in-flight reassembly state
    pub fn clear_transient(&self) {
        self.transient.lock().reassembly.clear();
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.transient.lock().reassembly.len()
    }

    pub fn acks(&self) -> &Arc<AckStore> {
        &self.acks
    }

    pub fn inbox(&self) -> &Arc<InboxStore> {
        &self.inbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SenderId;
    use crate::store::dedup::DEFAULT_DEDUP_TTL_MS;
    use crate::store::reassembly::DEFAULT_REASSEMBLY_IDLE_MS;
    use crate::store::MemoryStorage;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory backend whose inbox writes can be made to fail
    #[derive(Clone, Default)]
    struct FlakyInbox {
        inner: MemoryStorage,
        failing: Arc<AtomicBool>,
    }

    impl StorageBackend for FlakyInbox {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) && key.starts_with(b"inbox:") {
                return Err(StoreError::StorageError("disk full".to_string()));
            }
            self.inner.put(key, value)
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }
        fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
            self.inner.scan_prefix(prefix)
        }
        fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
            self.inner.count_prefix(prefix)
        }
        fn flush(&self) -> Result<(), StoreError> {
            self.inner.flush()
        }
    }

    fn pipeline(backend: &MemoryStorage) -> DeliveryPipeline {
        let backend: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        let acks = Arc::new(AckStore::open(backend.clone(), 16).unwrap());
        let inbox = Arc::new(InboxStore::open(backend.clone(), 16).unwrap());
        DeliveryPipeline::open(
            backend,
            acks,
            inbox,
            DEFAULT_REASSEMBLY_IDLE_MS,
            DEFAULT_DEDUP_TTL_MS,
            0,
        )
        .unwrap()
    }

    fn send(pipeline: &DeliveryPipeline, msg_id: u32, payload: &[u8], now: u64) -> DeliveryOutcome {
        let sender = SenderId::new("alice").unwrap();
        let mut last = None;
        for frame in MessageFrame::chunk(msg_id, Some(&sender), payload, 4).unwrap() {
            last = Some(pipeline.accept(sender.as_str(), &frame, now).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn test_partial_then_delivered() {
        let backend = MemoryStorage::new();
        let pipeline = pipeline(&backend);
        let frames = MessageFrame::chunk(7, None, b"abcdef", 4).unwrap();

        assert_eq!(
            pipeline.accept("peer", &frames[0], 0).unwrap(),
            DeliveryOutcome::Partial { received: 4, total: 6 }
        );
        assert!(pipeline.acks().is_empty());

        match pipeline.accept("peer", &frames[1], 1).unwrap() {
            DeliveryOutcome::Delivered(msg) => assert_eq!(msg.payload, b"abcdef".to_vec()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(pipeline.acks().len(), 1);
    }

    #[test]
    fn test_duplicate_within_window_acked_not_redelivered() {
        let backend = MemoryStorage::new();
        let pipeline = pipeline(&backend);

        assert!(matches!(
            send(&pipeline, 42, b"hello there", 1_000),
            DeliveryOutcome::Delivered(_)
        ));
        assert!(matches!(
            send(&pipeline, 42, b"hello there", 1_000 + 5 * 60 * 1000),
            DeliveryOutcome::Duplicate { message_id: 42, .. }
        ));

        assert_eq!(pipeline.inbox().len(), 1);
        assert_eq!(pipeline.acks().for_sender("alice").len(), 2);
    }

    #[test]
    fn test_redelivered_after_window() {
        let backend = MemoryStorage::new();
        let pipeline = pipeline(&backend);

        send(&pipeline, 42, b"hello", 0);
        assert!(matches!(
            send(&pipeline, 42, b"hello", DEFAULT_DEDUP_TTL_MS + 1),
            DeliveryOutcome::Delivered(_)
        ));
        assert_eq!(pipeline.inbox().len(), 2);
    }

    #[test]
    fn test_dedup_survives_reopen() {
        let backend = MemoryStorage::new();
        send(&pipeline(&backend), 5, b"once", 100);

        let reopened = pipeline(&backend);
        assert!(matches!(
            send(&reopened, 5, b"once", 200),
            DeliveryOutcome::Duplicate { .. }
        ));
        assert_eq!(reopened.inbox().len(), 1);
    }

    #[test]
    fn test_clear_transient_drops_partials() {
        let backend = MemoryStorage::new();
        let pipeline = pipeline(&backend);
        let frames = MessageFrame::chunk(1, None, b"abcdefgh", 4).unwrap();
        pipeline.accept("peer", &frames[0], 0).unwrap();
        assert_eq!(pipeline.pending_reassemblies(), 1);

        pipeline.clear_transient();
        assert_eq!(pipeline.pending_reassemblies(), 0);
        assert!(matches!(
            pipeline.accept("peer", &frames[1], 1).unwrap(),
            DeliveryOutcome::Dropped(DropReason::OutOfOrder { expected: 0, got: 4 })
        ));
    }

    #[test]
    fn test_failed_inbox_write_does_not_mark_seen() {
        let flaky = FlakyInbox::default();
        let backend: Arc<dyn StorageBackend> = Arc::new(flaky.clone());
        let acks = Arc::new(AckStore::open(backend.clone(), 16).unwrap());
        let inbox = Arc::new(InboxStore::open(backend.clone(), 16).unwrap());
        let pipeline = DeliveryPipeline::open(
            backend,
            acks,
            inbox,
            DEFAULT_REASSEMBLY_IDLE_MS,
            DEFAULT_DEDUP_TTL_MS,
            0,
        )
        .unwrap();
        let frames = MessageFrame::chunk(11, None, b"hi", 4).unwrap();

        flaky.failing.store(true, Ordering::SeqCst);
        assert!(pipeline.accept("peer", &frames[0], 0).is_err());
        assert!(pipeline.inbox().is_empty());
        assert!(pipeline.acks().is_empty());
        assert_eq!(flaky.inner.count_prefix(b"dedup:").unwrap(), 0);

        // the sender's retry inside the window is delivered, not deduped
        flaky.failing.store(false, Ordering::SeqCst);
        assert!(matches!(
            pipeline.accept("peer", &frames[0], 1_000).unwrap(),
            DeliveryOutcome::Delivered(_)
        ));
        assert_eq!(pipeline.inbox().len(), 1);
        assert_eq!(pipeline.acks().len(), 1);
    }
}
