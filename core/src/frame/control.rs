/// Control frame — selects which stream window the requester reads next
///
/// Format (10 bytes, little-endian):
/// [4 bytes] magic `ATST`
/// [1 byte]  version
/// [1 byte]  stream id
/// [4 bytes] offset

use super::{read_u32, STREAM_MAGIC, STREAM_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub stream_id: u8,
    pub offset: u32,
}

impl ControlFrame {
    /// Exact encoded size
    pub const LEN: usize = 10;

    pub fn new(stream_id: u8, offset: u32) -> Self {
        Self { stream_id, offset }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&STREAM_MAGIC);
        buf[4] = STREAM_VERSION;
        buf[5] = self.stream_id;
        buf[6..10].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Returns `None` when the bytes are not a control frame
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN || data[0..4] != STREAM_MAGIC || data[4] != STREAM_VERSION {
            return None;
        }
        Some(Self {
            stream_id: data[5],
            offset: read_u32(data, 6),
        })
    }
}
