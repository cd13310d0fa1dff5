//! Length-prefixed framing.
//!
//! Every message is a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`].

use crate::error::{FlexError, Result};
use crate::types::{RequestId, MIB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted on either channel.
pub const MAX_FRAME_SIZE: usize = 16 * MIB as usize;

/// Request or response wrapper carried by one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub request_id: RequestId,
    /// Operation name, for logging and sanity checks.
    pub operation: String,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(request_id: RequestId, operation: impl Into<String>, body: T) -> Self {
        Self {
            request_id,
            operation: operation.into(),
            body,
        }
    }
}

/// Encode an envelope into a complete frame.
pub fn encode_frame<T: Serialize>(envelope: &Envelope<T>) -> Result<Vec<u8>> {
    let payload = bincode::serialize(envelope)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FlexError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, envelope: &Envelope<T>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<Envelope<T>>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FlexError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
