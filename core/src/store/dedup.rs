// Dedup cache — time-bounded record of already-processed keys
//
// One record per key; inserting overwrites the expiry. When a backend is
// attached, records are written through so a restart inside the TTL window
// still suppresses re-delivery.

use super::{StorageBackend, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default TTL for message dedup records (10 minutes)
pub const DEFAULT_DEDUP_TTL_MS: u64 = 10 * 60 * 1000;

/// Maximum tracked keys before the soonest-expiring record is dropped
const MAX_RECORDS: usize = 10_000;

pub struct DedupCache {
    records: HashMap<String, u64>,
    ttl_ms: u64,
    persist: Option<(Arc<dyn StorageBackend>, &'static [u8])>,
}

impl DedupCache {
    /// In-memory cache
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            records: HashMap::new(),
            ttl_ms,
            persist: None,
        }
    }

    /// Cache that writes through to `backend` under `prefix`, reloading
    /// unexpired records (expired ones are deleted while loading)
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        prefix: &'static [u8],
        ttl_ms: u64,
        now: u64,
    ) -> Result<Self, StoreError> {
        let mut records = HashMap::new();
        for (key, value) in backend.scan_prefix(prefix)? {
            let expiry = value
                .as_slice()
                .try_into()
                .ok()
                .map(u64::from_le_bytes);
            match expiry {
                Some(expiry) if expiry > now => {
                    let name = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                    records.insert(name, expiry);
                }
                Some(_) => backend.remove(&key)?,
                None => {
                    warn!("Dropping malformed dedup record {:?}", key);
                    backend.remove(&key)?;
                }
            }
        }
        debug!("Dedup cache loaded {} live record(s)", records.len());

        Ok(Self {
            records,
            ttl_ms,
            persist: Some((backend, prefix)),
        })
    }

    /// Key for a (sender, message id) pair
    pub fn message_key(sender_id: &str, message_id: u32) -> String {
        format!("{}:{}", sender_id, message_id)
    }

    /// True if an unexpired record exists for `key`
    pub fn is_fresh(&self, key: &str, now: u64) -> bool {
        self.records.get(key).is_some_and(|&expiry| expiry > now)
    }

    /// Create or refresh the record for `key`
    pub fn insert(&mut self, key: &str, now: u64) -> Result<(), StoreError> {
        let expiry = now.saturating_add(self.ttl_ms);
        if self.records.len() >= MAX_RECORDS && !self.records.contains_key(key) {
            self.purge_expired(now)?;
            if self.records.len() >= MAX_RECORDS {
                self.evict_soonest()?;
            }
        }
        if let Some((backend, prefix)) = &self.persist {
            backend.put(&Self::storage_key(prefix, key), &expiry.to_le_bytes())?;
        }
        self.records.insert(key.to_string(), expiry);
        Ok(())
    }

    /// Returns true when `key` is a fresh duplicate. Otherwise records it and
    /// returns false. Duplicates do not extend the existing expiry.
    pub fn check_and_insert(&mut self, key: &str, now: u64) -> Result<bool, StoreError> {
        if self.is_fresh(key, now) {
            return Ok(true);
        }
        self.insert(key, now)?;
        Ok(false)
    }

    pub fn purge_expired(&mut self, now: u64) -> Result<usize, StoreError> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, &expiry)| expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.forget(key)?;
        }
        Ok(expired.len())
    }

    fn evict_soonest(&mut self) -> Result<(), StoreError> {
        let soonest = self
            .records
            .iter()
            .min_by_key(|(_, &expiry)| expiry)
            .map(|(key, _)| key.clone());
        if let Some(key) = soonest {
            self.forget(&key)?;
        }
        Ok(())
    }

    fn forget(&mut self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        if let Some((backend, prefix)) = &self.persist {
            backend.remove(&Self::storage_key(prefix, key))?;
        }
        Ok(())
    }

    fn storage_key(prefix: &[u8], key: &str) -> Vec<u8> {
        let mut full = prefix.to_vec();
        full.extend_from_slice(key.as_bytes());
        full
    }

    /// Drop in-memory records only; persisted records survive
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
