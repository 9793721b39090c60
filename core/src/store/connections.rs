// Connection log — redacted exchange records queued for optional later sync

use super::{BoundedLog, StorageBackend, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_CONNECTION_CAPACITY: usize = 512;

const CONNECTION_PREFIX: &[u8] = b"conn:";

/// Outcome of one completed exchange. Carries only the peer's anonymized
/// signature, never its transport address or raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Hex blake3 signature of the peer's anonymized payload
    pub peer_signature: String,
    pub compatibility: f64,
    /// Best similarity against our closed life phases, if we have any
    pub historical_resonance: Option<f64>,
    /// Situational context key the exchange happened in
    pub context: String,
    /// One line per applied insight, e.g. "novelty_seeking -> 0.720"
    pub insights: Vec<String>,
    pub recorded_at: u64,
}

pub struct ConnectionLog {
    log: Mutex<BoundedLog<ConnectionRecord>>,
}

impl ConnectionLog {
    pub fn open(backend: Arc<dyn StorageBackend>, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            log: Mutex::new(BoundedLog::open(backend, CONNECTION_PREFIX, capacity)?),
        })
    }

    pub fn push(&self, record: ConnectionRecord) -> Result<(), StoreError> {
        self.log.lock().push(record)?;
        Ok(())
    }

    /// Records not yet handed off, oldest first
    pub fn pending(&self) -> Vec<ConnectionRecord> {
        self.log.lock().to_vec()
    }

    /// Hand every pending record to a sync collaborator and forget it
    pub fn drain_for_sync(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.log.lock().drain()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}
