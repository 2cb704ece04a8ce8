//! Direct-channel frame definitions
//!
//! Transfer frames are JSON text messages sent over the ordered, reliable
//! data channel. Chunk payloads are base64 inside the JSON body so the
//! frames stay interoperable with browser peers.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::MAX_CHUNK_SIZE;

/// Maximum encoded frame size accepted from the channel.
///
/// Base64 inflates by 4/3; the slack covers the JSON envelope.
pub const MAX_FRAME_SIZE: usize = MAX_CHUNK_SIZE / 3 * 4 + 4096;

/// Frames of the chunked transfer protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferFrame {
    /// Announces a new transfer
    #[serde(rename = "file-transfer-start", rename_all = "camelCase")]
    Start {
        transfer_id: String,
        filename: String,
        file_size: u64,
        #[serde(default)]
        file_type: String,
        /// Absent when the sender uses the default chunk size
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_size: Option<u64>,
    },

    /// One slice of the file
    #[serde(rename = "file-transfer-chunk", rename_all = "camelCase")]
    Chunk {
        transfer_id: String,
        chunk_index: u64,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
    },

    /// All chunks have been sent
    #[serde(rename = "file-transfer-complete", rename_all = "camelCase")]
    Complete {
        transfer_id: String,
        /// Hex BLAKE3 digest of the whole file
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
}

impl TransferFrame {
    /// Transfer this frame belongs to
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferFrame::Start { transfer_id, .. }
            | TransferFrame::Chunk { transfer_id, .. }
            | TransferFrame::Complete { transfer_id, .. } => transfer_id,
        }
    }

    /// Serialize to a JSON text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Number of chunks needed for `total_size` bytes
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Expected length of chunk `index`
pub fn expected_chunk_len(total_size: u64, chunk_size: u64, index: u64) -> usize {
    let start = index.saturating_mul(chunk_size);
    total_size.saturating_sub(start).min(chunk_size) as usize
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_frame_wire_format() {
        let frame = TransferFrame::Start {
            transfer_id: "t1".into(),
            filename: "notes.txt".into(),
            file_size: 42,
            file_type: "text/plain".into(),
            chunk_size: None,
        };

        let json = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "file-transfer-start");
        assert_eq!(value["transferId"], "t1");
        assert_eq!(value["fileSize"], 42);
        assert_eq!(value["fileType"], "text/plain");
        assert!(value.get("chunkSize").is_none());
    }

    #[test]
    fn test_chunk_frame_is_base64() {
        let frame = TransferFrame::Chunk {
            transfer_id: "t1".into(),
            chunk_index: 3,
            chunk: b"hello".to_vec(),
        };

        let json = frame.encode().unwrap();
        assert!(json.contains(r#""chunk":"aGVsbG8=""#));
        assert!(json.contains(r#""chunkIndex":3"#));
        assert_eq!(TransferFrame::decode(&json).unwrap(), frame);
    }

    #[test]
    fn test_decode_browser_frames() {
        let start = r#"{"type":"file-transfer-start","transferId":"abc","filename":"a.png","fileSize":10,"fileType":"image/png"}"#;
        match TransferFrame::decode(start).unwrap() {
            TransferFrame::Start {
                file_size,
                chunk_size,
                ..
            } => {
                assert_eq!(file_size, 10);
                assert_eq!(chunk_size, None);
            }
            other => panic!("wrong frame: {:?}", other),
        }

        let complete = r#"{"type":"file-transfer-complete","transferId":"abc"}"#;
        let frame = TransferFrame::decode(complete).unwrap();
        assert_eq!(frame.transfer_id(), "abc");
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let bad = r#"{"type":"file-transfer-chunk","transferId":"x","chunkIndex":0,"chunk":"!!!"}"#;
        assert!(matches!(
            TransferFrame::decode(bad),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            TransferFrame::decode(&huge),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_chunk_math() {
        let c = 64 * 1024;
        assert_eq!(chunk_count(0, c), 0);
        assert_eq!(chunk_count(1, c), 1);
        assert_eq!(chunk_count(c, c), 1);
        assert_eq!(chunk_count(c + 1, c), 2);
        assert_eq!(expected_chunk_len(c + 1, c, 0), c as usize);
        assert_eq!(expected_chunk_len(c + 1, c, 1), 1);
        assert_eq!(expected_chunk_len(c + 1, c, 2), 0);
    }
}
