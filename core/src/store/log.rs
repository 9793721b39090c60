// Bounded log — persisted FIFO with oldest-first eviction
//
// Entries live under `<prefix><seq as u64 BE>` so a prefix scan yields them in
// insertion order. An in-memory mirror answers reads without touching storage.

use super::{StorageBackend, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BoundedLog<T> {
    backend: Arc<dyn StorageBackend>,
    prefix: &'static [u8],
    capacity: usize,
    entries: VecDeque<(u64, T)>,
    next_seq: u64,
}

impl<T> BoundedLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) a log, reloading whatever the backend holds.
    ///
    /// Undecodable records are dropped; if more than `capacity` records are
    /// found (capacity was lowered between runs) the oldest are evicted.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        prefix: &'static [u8],
        capacity: usize,
    ) -> Result<Self, StoreError> {
        if capacity == 0 {
            return Err(StoreError::InvalidCapacity);
        }

        let mut entries = VecDeque::new();
        let mut next_seq = 0u64;

        for (key, value) in backend.scan_prefix(prefix)? {
            let Some(seq) = Self::seq_from_key(prefix, &key) else {
                continue;
            };
            next_seq = next_seq.max(seq + 1);
            match bincode::deserialize::<T>(&value) {
                Ok(item) => entries.push_back((seq, item)),
                Err(e) => {
                    warn!("Dropping undecodable record {:?}: {}", key, e);
                    backend.remove(&key)?;
                }
            }
        }

        let mut log = Self {
            backend,
            prefix,
            capacity,
            entries,
            next_seq,
        };
        log.evict_over_capacity()?;
        Ok(log)
    }

    fn key_for(&self, seq: u64) -> Vec<u8> {
        let mut key = self.prefix.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn seq_from_key(prefix: &[u8], key: &[u8]) -> Option<u64> {
        let tail = key.get(prefix.len()..)?;
        let bytes: [u8; 8] = tail.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Append an entry, returning whatever was evicted to stay within capacity
    pub fn push(&mut self, item: T) -> Result<Vec<T>, StoreError> {
        let seq = self.next_seq;
        let value =
            bincode::serialize(&item).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.backend.put(&self.key_for(seq), &value)?;
        self.next_seq += 1;
        self.entries.push_back((seq, item));
        self.evict_over_capacity()
    }

    fn evict_over_capacity(&mut self) -> Result<Vec<T>, StoreError> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some((seq, item)) = self.entries.pop_front() {
                self.backend.remove(&self.key_for(seq))?;
                evicted.push(item);
            }
        }
        if !evicted.is_empty() {
            debug!(
                "Evicted {} oldest record(s) from {}",
                evicted.len(),
                String::from_utf8_lossy(self.prefix)
            );
        }
        Ok(evicted)
    }

    /// Remove and return every entry, oldest first
    pub fn drain(&mut self) -> Result<Vec<T>, StoreError> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some((seq, item)) = self.entries.pop_front() {
            self.backend.remove(&self.key_for(seq))?;
            drained.push(item);
        }
        self.backend.flush()?;
        Ok(drained)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn open(backend: &MemoryStorage, capacity: usize) -> BoundedLog<u32> {
        BoundedLog::open(Arc::new(backend.clone()), b"test:", capacity).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = BoundedLog::<u32>::open(Arc::new(MemoryStorage::new()), b"test:", 0);
        assert!(matches!(result, Err(StoreError::InvalidCapacity)));
    }

    #[test]
    fn test_evicts_oldest_first() {
        let backend = MemoryStorage::new();
        let mut log = open(&backend, 3);

        for i in 0..3 {
            assert!(log.push(i).unwrap().is_empty());
        }
        assert_eq!(log.push(3).unwrap(), vec![0]);
        assert_eq!(log.push(4).unwrap(), vec![1]);

        assert_eq!(log.to_vec(), vec![2, 3, 4]);
        assert_eq!(backend.count_prefix(b"test:").unwrap(), 3);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let backend = MemoryStorage::new();
        let mut log = open(&backend, 5);
        for i in 0..100 {
            log.push(i).unwrap();
            assert!(log.len() <= 5);
        }
        assert_eq!(log.to_vec(), vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn test_reopen_preserves_order_and_sequence() {
        let backend = MemoryStorage::new();
        {
            let mut log = open(&backend, 10);
            for i in 0..4 {
                log.push(i).unwrap();
            }
        }
        let mut log = open(&backend, 10);
        assert_eq!(log.to_vec(), vec![0, 1, 2, 3]);

        log.push(4).unwrap();
        let reopened = open(&backend, 10);
        assert_eq!(reopened.to_vec(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_trims() {
        let backend = MemoryStorage::new();
        {
            let mut log = open(&backend, 10);
            for i in 0..6 {
                log.push(i).unwrap();
            }
        }
        let log = open(&backend, 2);
        assert_eq!(log.to_vec(), vec![4, 5]);
        assert_eq!(backend.count_prefix(b"test:").unwrap(), 2);
    }

    #[test]
    fn test_drain_empties_storage() {
        let backend = MemoryStorage::new();
        let mut log = open(&backend, 10);
        log.push(1).unwrap();
        log.push(2).unwrap();

        assert_eq!(log.drain().unwrap(), vec![1, 2]);
        assert!(log.is_empty());
        assert_eq!(backend.count_prefix(b"test:").unwrap(), 0);
    }

    #[test]
    fn test_corrupt_record_dropped_on_open() {
        let backend = MemoryStorage::new();
        {
            let mut log = open(&backend, 10);
            log.push(7).unwrap();
        }
        let mut bad_key = b"test:".to_vec();
        bad_key.extend_from_slice(&9u64.to_be_bytes());
        backend.put(&bad_key, &[0xFF]).unwrap();

        let log = open(&backend, 10);
        assert_eq!(log.to_vec(), vec![7]);
        assert_eq!(backend.get(&bad_key).unwrap(), None);
    }
}
