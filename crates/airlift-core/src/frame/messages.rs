//! Strict per-message payload schemas.
//!
//! Field names match the wire (camelCase JSON); unknown or missing fields are
//! rejected rather than best-effort parsed. Chunk bytes travel as base64.

use serde::{Deserialize, Serialize};

/// Opens the verification handshake; carries the sender's identity. The
/// human-compared code is derived from both certificate fingerprints, so it
/// never rides the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyRequest {
    /// Sender's stable device id
    pub device_id: String,
    /// Sender's display name
    pub device_name: String,
}

/// The remote operator's verdict on a verification handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyResponse {
    /// Responder's stable device id
    pub device_id: String,
    /// Whether the remote operator accepted
    pub accepted: bool,
}

/// File metadata opening a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferRequest {
    /// Unique transfer id
    pub transfer_id: String,
    /// Artifact file name
    pub file_name: String,
    /// Artifact size in bytes
    pub file_size: u64,
    /// Whole-file BLAKE3 checksum, hex
    pub checksum: String,
    /// Whether the artifact is a packed directory
    pub is_directory: bool,
}

/// Accept or decline a transfer request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferAccept {
    /// Transfer being answered
    pub transfer_id: String,
    /// Whether the receiver will take the transfer
    pub accepted: bool,
}

/// One chunk of file data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChunkData {
    /// Transfer the chunk belongs to
    pub transfer_id: String,
    /// Zero-based chunk index
    pub chunk_index: u64,
    /// Chunk bytes, base64
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// BLAKE3 checksum of the chunk bytes, hex
    pub checksum: String,
}

/// Acknowledgement for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChunkAck {
    /// Transfer the ack belongs to
    pub transfer_id: String,
    /// Chunk index being acknowledged
    pub chunk_index: u64,
    /// Whether the receiver persisted the chunk
    pub success: bool,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_payload;

    #[test]
    fn chunk_data_roundtrips_binary() {
        let original = ChunkData {
            transfer_id: "t-1".to_string(),
            chunk_index: 3,
            data: vec![0, 1, 2, 255, 254],
            checksum: "abc".to_string(),
        };
        let json = serde_json::to_vec(&original).unwrap();
        let decoded: ChunkData = decode_payload(&json).unwrap();
        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.chunk_index, 3);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let request = TransferRequest {
            transfer_id: "t".to_string(),
            file_name: "a.bin".to_string(),
            file_size: 42,
            checksum: "cc".to_string(),
            is_directory: false,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"transferId\""));
        assert!(json.contains("\"fileName\""));
        assert!(json.contains("\"isDirectory\""));
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(decode_payload::<TransferRequest>(br#"{"transferId":"t"}"#).is_err());
        assert!(decode_payload::<ChunkAck>(br#"{"transferId":"t","chunkIndex":0}"#).is_err());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let payload = br#"{"transferId":"t","chunkIndex":0,"data":"!!!","checksum":"c"}"#;
        assert!(decode_payload::<ChunkData>(payload).is_err());
    }
}
