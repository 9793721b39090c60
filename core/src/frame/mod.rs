//! Attune wire frames — fixed-layout binary frames for the radio read/write path
//!
//! Two frame families share the link, each starting with its own 4-byte magic
//! tag followed by a 1-byte version:
//!
//! - Stream family (`ATST`): [`ControlFrame`] selects a logical stream and an
//!   offset, [`ReadResponseFrame`] returns one window of that stream.
//! - Message family (`ATMS`): [`MessageFrame`] v1 (20-byte header) and v2
//!   (56-byte header carrying a 36-byte sender id) carry chunked messages.
//!
//! Decoders never fail loudly: a magic, version or length mismatch yields
//! `None` so the caller can try the next interpretation. [`Frame::parse`]
//! does exactly that in a fixed priority order.

pub mod control;
pub mod message;
pub mod read;

pub use control::ControlFrame;
pub use message::{MessageFrame, SenderId, SENDER_ID_LEN};
pub use read::ReadResponseFrame;

use thiserror::Error;

/// Magic tag of the control/read-response family
pub const STREAM_MAGIC: [u8; 4] = *b"ATST";

/// Magic tag of the message family
pub const MESSAGE_MAGIC: [u8; 4] = *b"ATMS";

/// Version byte of the control/read-response family
pub const STREAM_VERSION: u8 = 0x01;

/// Default payload ceiling for one read/write operation
pub const DEFAULT_MAX_CHUNK: usize = 180;

/// Logical stream carrying the anonymized profile payload
pub const STREAM_PROFILE: u8 = 0x01;

/// Logical stream carrying acknowledgements addressed to the reader
pub const STREAM_ACKS: u8 = 0x02;

/// Errors raised while *encoding* frames. Decoding returns `Option` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Sender id too long: {0} bytes (max {SENDER_ID_LEN})")]
    SenderIdTooLong(usize),

    #[error("Sender id must be ASCII")]
    SenderIdNotAscii,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Chunk too large: {0} bytes (max {max})", max = u16::MAX)]
    ChunkTooLarge(usize),

    #[error("Chunk size must be > 0")]
    ZeroChunk,

    #[error("Offset {offset} beyond total length {total}")]
    OffsetOutOfRange { offset: u32, total: u32 },
}

/// Tagged result of [`Frame::parse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    ReadResponse(ReadResponseFrame),
    Message(MessageFrame),
}

impl Frame {
    /// Try every known layout in priority order.
    ///
    /// Control frames are matched first because they are the only exact-size
    /// layout; message v2 is tried before v1 since both share a magic tag.
    pub fn parse(data: &[u8]) -> Option<Frame> {
        if let Some(frame) = ControlFrame::decode(data) {
            return Some(Frame::Control(frame));
        }
        if let Some(frame) = ReadResponseFrame::decode(data) {
            return Some(Frame::ReadResponse(frame));
        }
        if let Some(frame) = MessageFrame::decode_v2(data) {
            return Some(Frame::Message(frame));
        }
        MessageFrame::decode_v1(data).map(Frame::Message)
    }

    /// Encode back to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Control(frame) => frame.encode().to_vec(),
            Frame::ReadResponse(frame) => frame.encode(),
            Frame::Message(frame) => frame.encode(),
        }
    }
}

pub(crate) fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control() {
        let bytes = ControlFrame::new(STREAM_PROFILE, 42).encode();
        assert_eq!(
            Frame::parse(&bytes),
            Some(Frame::Control(ControlFrame::new(STREAM_PROFILE, 42)))
        );
    }

    #[test]
    fn test_parse_read_response() {
        let stream = vec![7u8; 20];
        let frame = ReadResponseFrame::window(STREAM_PROFILE, &stream, 0, 8).unwrap();
        let parsed = Frame::parse(&frame.encode());
        assert_eq!(parsed, Some(Frame::ReadResponse(frame)));
    }

    #[test]
    fn test_parse_message_versions() {
        let sender = SenderId::new("node-a").unwrap();
        let v2 = MessageFrame::chunk(9, Some(&sender), b"hi", 16).unwrap();
        let v1 = MessageFrame::chunk(9, None, b"hi", 16).unwrap();

        match Frame::parse(&v2[0].encode()) {
            Some(Frame::Message(frame)) => assert_eq!(frame.sender.as_ref(), Some(&sender)),
            other => panic!("expected v2 message, got {:?}", other),
        }
        match Frame::parse(&v1[0].encode()) {
            Some(Frame::Message(frame)) => assert!(frame.sender.is_none()),
            other => panic!("expected v1 message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unrecognized() {
        assert_eq!(Frame::parse(&[]), None);
        assert_eq!(Frame::parse(b"garbage bytes that match nothing"), None);

        let mut bytes = ControlFrame::new(1, 0).encode();
        bytes[4] = 0x7F; // unknown version
        assert_eq!(Frame::parse(&bytes), None);
    }

    #[test]
    fn test_encode_matches_variant_encoding() {
        let frame = Frame::Control(ControlFrame::new(STREAM_ACKS, 3));
        assert_eq!(frame.encode(), ControlFrame::new(STREAM_ACKS, 3).encode().to_vec());
    }
}
