//! Remote Wire Framing
//!
//! Frames between peer containers are a 4-byte big-endian length prefix
//! followed by a JSON envelope. JSON keeps the wire self-describing and
//! version-tolerant: unknown fields are ignored on decode, and a peer that
//! cannot parse a frame skips it instead of tearing the connection down.
//!
//! The first frame on every outbound connection is `Hello`, which carries
//! the sender's container identity; no further handshake exists.

use colony_types::{NetInfo, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};
use crate::MAX_FRAME_BYTES;

/// Envelope exchanged on a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Peer identity, first frame on every connection.
    Hello { container: NetInfo },
    /// A request for an actor hosted by the receiving container.
    Req {
        from_container: String,
        request: Request,
    },
    /// A response to a request the receiving container sent.
    Res { response: Response },
    /// Frame kind introduced by a newer peer; skipped on receive.
    #[serde(other)]
    Unknown,
}

/// Encode a frame as length-prefixed JSON.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(TransportError::protocol(format!(
            "frame size {} exceeds maximum {}",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write a frame to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let buf = encode(frame)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| TransportError::network_with_source("failed to write frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::network_with_source("failed to flush stream", e))?;
    Ok(())
}

/// Read one frame from a stream. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(TransportError::network_with_source(
                "failed to read frame length",
                e,
            ))
        }
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TransportError::network_with_source("failed to read frame body", e))?;

    let frame = serde_json::from_slice(&body)
        .map_err(|e| TransportError::protocol_with_source("unparseable frame", e))?;
    Ok(Some(frame))
}
