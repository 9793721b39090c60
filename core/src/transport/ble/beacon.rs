/// BLE advertisement service data for Attune discovery
///
/// Layout (6 bytes, separately versioned from the wire frames):
/// [1 byte]  version (1)
/// [1 byte]  flags: bit0 CONNECTABLE, bit1 HAS_PROFILE
/// [4 bytes] node hint, blake3(node id || epoch) truncated
///
/// The node hint rotates every epoch (default 15 minutes) so scanners can
/// de-duplicate advertisements inside an epoch without learning a stable id.

use thiserror::Error;

/// Service data format version
pub const SERVICE_DATA_VERSION: u8 = 0x01;

/// Encoded service data length
pub const SERVICE_DATA_LEN: usize = 6;

/// Default node hint rotation period in seconds (15 minutes)
pub const DEFAULT_BEACON_ROTATION_SECS: u64 = 15 * 60;

pub const FLAG_CONNECTABLE: u8 = 0b0000_0001;
pub const FLAG_HAS_PROFILE: u8 = 0b0000_0010;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    #[error("Rotation period must be > 0")]
    InvalidRotationPeriod,
}

/// Parsed advertisement service data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceData {
    pub flags: u8,
    pub node_hint: [u8; 4],
}

impl ServiceData {
    pub fn new(connectable: bool, has_profile: bool, node_hint: [u8; 4]) -> Self {
        let mut flags = 0;
        if connectable {
            flags |= FLAG_CONNECTABLE;
        }
        if has_profile {
            flags |= FLAG_HAS_PROFILE;
        }
        Self { flags, node_hint }
    }

    pub fn is_connectable(&self) -> bool {
        self.flags & FLAG_CONNECTABLE != 0
    }

    pub fn has_profile(&self) -> bool {
        self.flags & FLAG_HAS_PROFILE != 0
    }

    pub fn encode(&self) -> [u8; SERVICE_DATA_LEN] {
        let mut buf = [0u8; SERVICE_DATA_LEN];
        buf[0] = SERVICE_DATA_VERSION;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.node_hint);
        buf
    }

    /// Parse service data. Unknown versions and short blobs yield `None`;
    /// trailing bytes are tolerated for forward compatibility.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SERVICE_DATA_LEN || data[0] != SERVICE_DATA_VERSION {
            return None;
        }
        let mut node_hint = [0u8; 4];
        node_hint.copy_from_slice(&data[2..6]);
        Some(Self {
            flags: data[1],
            node_hint,
        })
    }

    pub fn hint_hex(&self) -> String {
        hex::encode(self.node_hint)
    }
}

/// Builds service data for the local node
#[derive(Debug, Clone)]
pub struct BeaconBuilder {
    node_id: String,
    rotation_period_secs: u64,
}

impl BeaconBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            rotation_period_secs: DEFAULT_BEACON_ROTATION_SECS,
        }
    }

    /// Set the hint rotation period in seconds
    pub fn with_rotation_period(mut self, secs: u64) -> Result<Self, BeaconError> {
        if secs == 0 {
            return Err(BeaconError::InvalidRotationPeriod);
        }
        self.rotation_period_secs = secs;
        Ok(self)
    }

    pub fn rotation_epoch(&self, now_ms: u64) -> u32 {
        (now_ms / 1000 / self.rotation_period_secs) as u32
    }

    pub fn node_hint(&self, now_ms: u64) -> [u8; 4] {
        let epoch = self.rotation_epoch(now_ms);
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.node_id.as_bytes());
        hasher.update(&epoch.to_le_bytes());
        let hash = hasher.finalize();
        let mut hint = [0u8; 4];
        hint.copy_from_slice(&hash.as_bytes()[0..4]);
        hint
    }

    /// Service data for the epoch containing `now_ms`
    pub fn build(&self, connectable: bool, has_profile: bool, now_ms: u64) -> ServiceData {
        ServiceData::new(connectable, has_profile, self.node_hint(now_ms))
    }
}
