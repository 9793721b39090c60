/// Read response frame — one window of a logical stream
///
/// Format (16-byte header + payload, little-endian):
/// [4 bytes] magic `ATST`
/// [1 byte]  version
/// [1 byte]  stream id
/// [4 bytes] total stream length
/// [4 bytes] offset of this window
/// [2 bytes] chunk length
/// [N bytes] payload

use super::{read_u16, read_u32, FrameError, STREAM_MAGIC, STREAM_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponseFrame {
    pub stream_id: u8,
    pub total_len: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
}

impl ReadResponseFrame {
    /// Header size in bytes
    pub const HEADER_LEN: usize = 16;

    /// Cut the window `[offset, offset + min(max_chunk, total - offset))` out of
    /// `stream`. An offset past the end is clamped to the end, producing an
    /// empty window that still reports the true total length.
    pub fn window(
        stream_id: u8,
        stream: &[u8],
        offset: u32,
        max_chunk: usize,
    ) -> Result<Self, FrameError> {
        if max_chunk == 0 {
            return Err(FrameError::ZeroChunk);
        }
        let total_len =
            u32::try_from(stream.len()).map_err(|_| FrameError::PayloadTooLarge(stream.len()))?;
        let start = offset.min(total_len) as usize;
        let chunk_len = max_chunk.min(u16::MAX as usize).min(stream.len() - start);

        Ok(Self {
            stream_id,
            total_len,
            offset: start as u32,
            payload: stream[start..start + chunk_len].to_vec(),
        })
    }

    pub fn chunk_len(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Whether this window reaches the end of the stream
    pub fn is_last(&self) -> bool {
        self.offset as usize + self.payload.len() >= self.total_len as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&STREAM_MAGIC);
        buf.push(STREAM_VERSION);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.total_len.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.chunk_len().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Returns `None` when the bytes are not a well-formed read response
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_LEN || data[0..4] != STREAM_MAGIC || data[4] != STREAM_VERSION
        {
            return None;
        }

        let stream_id = data[5];
        let total_len = read_u32(data, 6);
        let offset = read_u32(data, 10);
        let chunk_len = read_u16(data, 14) as usize;

        if data.len() != Self::HEADER_LEN + chunk_len {
            return None;
        }
        if offset as u64 + chunk_len as u64 > total_len as u64 {
            return None;
        }

        Some(Self {
            stream_id,
            total_len,
            offset,
            payload: data[Self::HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_window_tail_of_stream() {
        let data = stream(600);
        let frame = ReadResponseFrame::window(1, &data, 512, 180).unwrap();

        assert_eq!(frame.offset, 512);
        assert_eq!(frame.chunk_len(), 88);
        assert_eq!(frame.total_len, 600);
        assert_eq!(frame.payload, data[512..600].to_vec());
        assert!(frame.is_last());
    }

    #[test]
    fn test_window_capped_by_max_chunk() {
        let data = stream(600);
        let frame = ReadResponseFrame::window(1, &data, 0, 180).unwrap();
        assert_eq!(frame.chunk_len(), 180);
        assert!(!frame.is_last());
    }

    #[test]
    fn test_window_offset_past_end_is_clamped() {
        let data = stream(10);
        let frame = ReadResponseFrame::window(1, &data, 50, 180).unwrap();
        assert_eq!(frame.offset, 10);
        assert!(frame.payload.is_empty());
        assert!(frame.is_last());
    }

    #[test]
    fn test_window_zero_chunk_rejected() {
        assert_eq!(
            ReadResponseFrame::window(1, &[1, 2, 3], 0, 0),
            Err(FrameError::ZeroChunk)
        );
    }

    #[test]
    fn test_header_layout() {
        let frame = ReadResponseFrame::window(3, &stream(40), 8, 16).unwrap();
        let bytes = frame.encode();

        assert_eq!(bytes.len(), ReadResponseFrame::HEADER_LEN + 16);
        assert_eq!(&bytes[0..4], b"ATST");
        assert_eq!(bytes[5], 3);
        assert_eq!(read_u32(&bytes, 6), 40);
        assert_eq!(read_u32(&bytes, 10), 8);
        assert_eq!(read_u16(&bytes, 14), 16);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = ReadResponseFrame::window(1, &stream(40), 0, 16)
            .unwrap()
            .encode();
        bytes.pop();
        assert!(ReadResponseFrame::decode(&bytes).is_none());
    }

    #[test]
    fn test_decode_rejects_window_past_total() {
        let mut bytes = ReadResponseFrame::window(1, &stream(40), 0, 16)
            .unwrap()
            .encode();
        // Claim a total shorter than offset + chunk
        bytes[6..10].copy_from_slice(&8u32.to_le_bytes());
        assert!(ReadResponseFrame::decode(&bytes).is_none());
    }

    #[test]
    fn test_control_frame_is_not_a_read_response() {
        let control = super::super::ControlFrame::new(1, 0).encode();
        assert!(ReadResponseFrame::decode(&control).is_none());
    }
}
