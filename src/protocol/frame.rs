use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use super::handshake::Handshake;
use crate::error::Result;

/// Largest frame either side may send
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// One message on the plugin connection, carried in a length-prefixed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Handshake(Handshake),
    Request {
        id: u64,
        capability: String,
        method: String,
        payload: Value,
    },
    /// A unary reply, or one chunk of a streamed reply
    Response { id: u64, payload: Value },
    /// Terminates a streamed reply
    End { id: u64 },
    Error {
        id: u64,
        code: String,
        message: String,
    },
    /// Host abandons an in-flight call
    Cancel { id: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
