// Store module — transient and durable state behind single-owner APIs

pub mod ack;
pub mod backend;
pub mod connections;
pub mod dedup;
pub mod delivery;
pub mod inbox;
pub mod log;
pub mod reassembly;

pub use ack::{AckStore, Acknowledgement, ACK_WIRE_LEN};
pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use connections::{ConnectionLog, ConnectionRecord};
pub use dedup::DedupCache;
pub use delivery::{DeliveryOutcome, DeliveryPipeline};
pub use inbox::{InboundMessage, InboxStore};
pub use log::BoundedLog;
pub use reassembly::{ChunkOutcome, DropReason, ReassemblyEntry, ReassemblyStore};

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Capacity must be > 0")]
    InvalidCapacity,
}
