//! Length-prefixed JSON framing
//!
//! Every frame is a 4-byte big-endian body length followed by the body: one
//! compact UTF-8 JSON [`WorkerMessage`]. Zero-length and oversized frames are
//! rejected before the body is read.

use crate::error::ProtocolError;
use crate::protocol::{WorkerMessage, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message as a complete frame (prefix + body)
pub fn encode_frame(message: &WorkerMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_message<W>(writer: &mut W, message: &WorkerMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    tracing::debug!("ipc: sent {} ({} bytes)", message.kind(), frame.len());
    Ok(())
}

/// Read one frame. A clean EOF before the length prefix is [`ProtocolError::Closed`].
pub async fn read_message<R>(reader: &mut R) -> Result<WorkerMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message: WorkerMessage = serde_json::from_slice(&body)?;
    tracing::debug!("ipc: received {} ({} bytes)", message.kind(), len + 4);
    Ok(message)
}
