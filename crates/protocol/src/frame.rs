//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw chunk bytes.

use serde::{Deserialize, Serialize};

/// Header carried in front of every chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    /// Correlation id, echoed back in the matching `chunk_ack`.
    pub id: String,
    pub upload_id: String,
    pub index: u32,
    pub total_chunks: u32,
    /// Hex SHA-256 of the payload. Empty skips verification.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Parses a raw binary WebSocket frame into its header and payload.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkHeader, Vec<u8>), FrameError> {
    let Some(len_bytes) = data.get(..4) else {
        return Err(FrameError::TooShort);
    };
    let header_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
        as usize;

    let rest = &data[4..];
    if rest.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: ChunkHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

/// Encodes a chunk header and its payload into a single binary frame.
pub fn encode_chunk_frame(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header_json =
        serde_json::to_vec(header).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let header_len = u32::try_from(header_json.len()).map_err(|_| FrameError::HeaderTooLarge)?;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from chunk frame encoding and parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("header exceeds 4 GiB")]
    HeaderTooLarge,

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
