//! Wire framing: `[u32 big-endian length][u8 type][payload]`.
//!
//! `length` counts the type byte plus the payload. Payloads are strict JSON;
//! receivers reassemble frames incrementally from a byte stream that may
//! deliver partial frames or several frames per read.

pub mod messages;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Frame header size on the wire: length prefix plus type byte.
pub const HEADER_LEN: usize = 5;

/// Upper bound on `length`. A 1 MiB chunk rides as base64 inside JSON, so the
/// largest legitimate frame is well under 2 MiB; anything bigger is hostile
/// or corrupt.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Identity exchange opening the verification handshake
    VerifyRequest = 1,
    /// Operator verdict for a verification handshake
    VerifyResponse = 2,
    /// File metadata opening a transfer
    TransferRequest = 3,
    /// Accept or decline a transfer request
    TransferAccept = 4,
    /// One chunk of file data
    ChunkData = 5,
    /// Acknowledgement for one chunk
    ChunkAck = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::VerifyRequest),
            2 => Ok(Self::VerifyResponse),
            3 => Ok(Self::TransferRequest),
            4 => Ok(Self::TransferAccept),
            5 => Ok(Self::ChunkData),
            6 => Ok(Self::ChunkAck),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Framing and payload errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared length exceeds the protocol maximum
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversize(u32),

    /// Declared length cannot hold a type byte
    #[error("frame length must be at least 1")]
    Empty,

    /// Type byte outside the known message set
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Payload failed strict schema validation
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One decoded frame, type byte still raw so dispatchers can drop unknown
/// types without tearing the connection down.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Wire type byte
    pub kind: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Encode a frame from raw payload bytes.
#[must_use]
pub fn encode(kind: MessageType, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Encode a typed message as a JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_message<T: Serialize>(kind: MessageType, message: &T) -> Result<Vec<u8>, FrameError> {
    Ok(encode(kind, &serde_json::to_vec(message)?))
}

/// Decode a strict JSON payload. Unknown or missing fields are rejected.
///
/// # Errors
///
/// Returns an error if the payload does not match the schema exactly.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Incremental frame reassembler.
///
/// Feed it whatever the socket delivers; it yields complete frames as they
/// become available and keeps any trailing partial frame buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error on an oversize or empty declared length; the stream
    /// is unrecoverable after that since framing is lost.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if length == 0 {
            return Err(FrameError::Empty);
        }
        if length > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(length));
        }
        let total = 4 + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let kind = self.buf[4];
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(RawFrame { kind, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::messages::TransferAccept;

    #[test]
    fn encode_layout_is_bit_exact() {
        let frame = encode(MessageType::ChunkAck, b"{}");
        assert_eq!(&frame[..4], &3u32.to_be_bytes());
        assert_eq!(frame[4], 6);
        assert_eq!(&frame[5..], b"{}");
    }

    #[test]
    fn decoder_handles_partial_delivery() {
        let frame = encode(MessageType::TransferAccept, b"{\"ok\":1}");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[3..7]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[7..]);
        let raw = decoder.next_frame().unwrap().unwrap();
        assert_eq!(raw.kind, 4);
        assert_eq!(raw.payload, b"{\"ok\":1}");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_handles_coalesced_frames() {
        let mut bytes = encode(MessageType::VerifyRequest, b"a");
        bytes.extend(encode(MessageType::VerifyResponse, b"bb"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(first.kind, 1);
        assert_eq!(first.payload, b"a");

        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(second.kind, 2);
        assert_eq!(second.payload, b"bb");

        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversize_frames_are_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        bytes.push(5);
        decoder.extend(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::Oversize(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let payload = br#"{"transferId":"t","accepted":true,"extra":1}"#;
        assert!(decode_payload::<TransferAccept>(payload).is_err());
    }

    #[test]
    fn unknown_type_bytes_surface_as_errors_at_dispatch() {
        assert!(MessageType::try_from(7).is_err());
        assert!(MessageType::try_from(0).is_err());
        assert_eq!(MessageType::try_from(5).unwrap(), MessageType::ChunkData);
    }
}
