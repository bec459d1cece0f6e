//! Framing for the two transports.
//!
//! Direct peer links: length-prefix (4 bytes LE) + bincode `LinkMessage`.
//! Relay: one JSON text message per frame.

use serde::{Deserialize, Serialize};

use crate::chunk::Frame;
use crate::identity::NotebookId;
use crate::protocol::Target;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Message on a direct peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMessage {
    /// First message each side sends after connecting.
    Hello {
        protocol_version: u8,
        notebook: NotebookId,
    },
    Frame(Frame),
}

/// Encode a link message: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &LinkMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one link message from the front of `bytes`. Returns it and the bytes consumed.
/// `NeedMore` means the caller should read more and retry.
pub fn decode_frame(bytes: &[u8]) -> Result<(LinkMessage, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: LinkMessage =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid text frame: {0}")]
    Text(#[from] serde_json::Error),
    /// The relay answered with an error body instead of a frame.
    #[error("relay error: {0}")]
    ServerError(String),
}

/// Outbound relay message: one frame plus where the relay should deliver it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub target: Target,
    pub frame: Frame,
}

pub fn relay_text(target: Target, frame: &Frame) -> Result<String, FrameEncodeError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        target: Target,
        frame: &'a Frame,
    }
    Ok(serde_json::to_string(&Borrowed { target, frame })?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerErrorBody {
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Parse an inbound relay text message. Accepts a bare frame or an envelope.
pub fn frame_from_text(text: &str) -> Result<Frame, FrameDecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("messageId").is_some() {
        return Ok(serde_json::from_value(value)?);
    }
    if value.get("frame").is_some() {
        let envelope: RelayEnvelope = serde_json::from_value(value)?;
        return Ok(envelope.frame);
    }
    match serde_json::from_value::<ServerErrorBody>(value) {
        Ok(body) => Err(FrameDecodeError::ServerError(match body.request_id {
            Some(id) => format!("{} (request {})", body.message, id),
            None => body.message,
        })),
        Err(e) => Err(FrameDecodeError::Text(e)),
    }
}
