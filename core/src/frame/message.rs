/// Message frame — one chunk of a pushed message
///
/// v1 format (20-byte header, little-endian):
/// [4 bytes] magic `ATMS`
/// [1 byte]  version (1)
/// [1 byte]  reserved (0)
/// [4 bytes] message id
/// [4 bytes] total message length
/// [4 bytes] offset of this chunk
/// [2 bytes] chunk length
/// [N bytes] payload
///
/// v2 (56-byte header) is the v1 layout with version 2 and a 36-byte ASCII
/// sender id, NUL right-padded, inserted between the chunk length and the
/// payload. v1 senders are identified by their transport address instead.

use super::{read_u16, read_u32, FrameError, MESSAGE_MAGIC};
use std::fmt;

/// Fixed width of the v2 sender id field
pub const SENDER_ID_LEN: usize = 36;

const VERSION_V1: u8 = 0x01;
const VERSION_V2: u8 = 0x02;

/// ASCII sender id that fits the v2 header (a hyphenated UUID is exactly 36)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(String);

impl SenderId {
    pub fn new(id: &str) -> Result<Self, FrameError> {
        if !id.is_ascii() {
            return Err(FrameError::SenderIdNotAscii);
        }
        if id.len() > SENDER_ID_LEN {
            return Err(FrameError::SenderIdTooLong(id.len()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_field(&self) -> [u8; SENDER_ID_LEN] {
        let mut field = [0u8; SENDER_ID_LEN];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    fn from_field(field: &[u8]) -> Option<Self> {
        let end = field
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map(|i| i + 1)?;
        let raw = &field[..end];
        if !raw.is_ascii() {
            return None;
        }
        std::str::from_utf8(raw).ok().map(|s| Self(s.to_string()))
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub msg_id: u32,
    pub total_len: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
    /// Present on v2 frames only
    pub sender: Option<SenderId>,
}

impl MessageFrame {
    pub const V1_HEADER_LEN: usize = 20;
    pub const V2_HEADER_LEN: usize = Self::V1_HEADER_LEN + SENDER_ID_LEN;

    /// Split `payload` into in-order frames of at most `max_chunk` bytes.
    ///
    /// An empty payload still produces one (empty) frame so that the receiver
    /// observes a complete zero-length message.
    pub fn chunk(
        msg_id: u32,
        sender: Option<&SenderId>,
        payload: &[u8],
        max_chunk: usize,
    ) -> Result<Vec<MessageFrame>, FrameError> {
        if max_chunk == 0 {
            return Err(FrameError::ZeroChunk);
        }
        if max_chunk > u16::MAX as usize {
            return Err(FrameError::ChunkTooLarge(max_chunk));
        }
        let total_len =
            u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

        let make = |offset: usize, chunk: &[u8]| MessageFrame {
            msg_id,
            total_len,
            offset: offset as u32,
            payload: chunk.to_vec(),
            sender: sender.cloned(),
        };

        if payload.is_empty() {
            return Ok(vec![make(0, &[])]);
        }

        Ok(payload
            .chunks(max_chunk)
            .enumerate()
            .map(|(index, chunk)| make(index * max_chunk, chunk))
            .collect())
    }

    pub fn version(&self) -> u8 {
        if self.sender.is_some() {
            VERSION_V2
        } else {
            VERSION_V1
        }
    }

    pub fn chunk_len(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn header_len(&self) -> usize {
        if self.sender.is_some() {
            Self::V2_HEADER_LEN
        } else {
            Self::V1_HEADER_LEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len() + self.payload.len());
        buf.extend_from_slice(&MESSAGE_MAGIC);
        buf.push(self.version());
        buf.push(0); // reserved
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.total_len.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.chunk_len().to_le_bytes());
        if let Some(sender) = &self.sender {
            buf.extend_from_slice(&sender.to_field());
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode_v1(data: &[u8]) -> Option<Self> {
        Self::decode_with(data, VERSION_V1)
    }

    pub fn decode_v2(data: &[u8]) -> Option<Self> {
        Self::decode_with(data, VERSION_V2)
    }

    fn decode_with(data: &[u8], version: u8) -> Option<Self> {
        let header_len = if version == VERSION_V2 {
            Self::V2_HEADER_LEN
        } else {
            Self::V1_HEADER_LEN
        };
        if data.len() < header_len || data[0..4] != MESSAGE_MAGIC || data[4] != version {
            return None;
        }

        let msg_id = read_u32(data, 6);
        let total_len = read_u32(data, 10);
        let offset = read_u32(data, 14);
        let chunk_len = read_u16(data, 18) as usize;

        if data.len() != header_len + chunk_len {
            return None;
        }
        if offset as u64 + chunk_len as u64 > total_len as u64 {
            return None;
        }

        let sender = if version == VERSION_V2 {
            Some(SenderId::from_field(
                &data[Self::V1_HEADER_LEN..Self::V2_HEADER_LEN],
            )?)
        } else {
            None
        };

        Some(Self {
            msg_id,
            total_len,
            offset,
            payload: data[header_len..].to_vec(),
            sender,
        })
    }
}
