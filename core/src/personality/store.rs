// Profile storage — the local profile and its transformation tracker

use super::profile::PersonalityProfile;
use super::transformation::TransformationTracker;
use crate::store::{StorageBackend, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

const PROFILE_KEY: &[u8] = b"profile:current";
const TRACKER_KEY: &[u8] = b"profile:tracker";

pub enum ProfileStore {
    Memory,
    Persistent(Arc<dyn StorageBackend>),
}

impl ProfileStore {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Self {
        Self::Persistent(backend)
    }

    /// Save profile and tracker together, then flush
    pub fn save(
        &self,
        profile: &PersonalityProfile,
        tracker: &TransformationTracker,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory => Ok(()),
            Self::Persistent(db) => {
                db.put(PROFILE_KEY, &encode(profile)?)?;
                db.put(TRACKER_KEY, &encode(tracker)?)?;
                db.flush()
            }
        }
    }

    /// Stored profile, or the neutral default stamped `now` when none exists
    pub fn load_profile(&self, now: u64) -> Result<PersonalityProfile, StoreError> {
        match self.load(PROFILE_KEY)? {
            Some(profile) => Ok(profile),
            None => Ok(PersonalityProfile::neutral(now)),
        }
    }

    /// A tracker that fails to decode starts over instead of blocking startup
    pub fn load_tracker(&self) -> Result<TransformationTracker, StoreError> {
        match self.load(TRACKER_KEY) {
            Ok(tracker) => Ok(tracker.unwrap_or_default()),
            Err(StoreError::SerializationError(e)) => {
                warn!("Discarding unreadable transformation tracker: {}", e);
                Ok(TransformationTracker::default())
            }
            Err(e) => Err(e),
        }
    }

    fn load<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self {
            Self::Memory => Ok(None),
            Self::Persistent(db) => match db.get(key)? {
                Some(bytes) => bincode::deserialize(&bytes)
                    .map(Some)
                    .map_err(|e| StoreError::SerializationError(e.to_string())),
                None => Ok(None),
            },
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::SerializationError(e.to_string()))
}
