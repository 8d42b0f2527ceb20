//! Frame-at-a-time reading and writing over async byte streams.
//!
//! Reads are two-phase: exactly [`HEADER_LEN`] bytes, then exactly the
//! declared payload length. The payload buffer is only allocated after the
//! header passed the size check.

use crate::transport::protocol::{FrameHeader, Message, HEADER_LEN};
use crate::utils::{NetworkError, NodeError, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one complete frame.
///
/// A clean end of stream before the first header byte yields
/// `NetworkError::ConnectionClosed`; an end of stream inside a frame is a
/// transport error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let first = reader.read(&mut raw).await.map_err(transport_error)?;
    if first == 0 {
        return Err(NetworkError::ConnectionClosed.into());
    }
    if first < HEADER_LEN {
        reader
            .read_exact(&mut raw[first..])
            .await
            .map_err(transport_error)?;
    }

    let header = FrameHeader::parse(&raw)?;
    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload).await.map_err(transport_error)?;

    Ok(header.into_message(payload))
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode();
    writer.write_all(&bytes).await.map_err(transport_error)?;
    writer.flush().await.map_err(transport_error)?;
    Ok(())
}

fn transport_error(err: std::io::Error) -> NodeError {
    let reason = match err.kind() {
        ErrorKind::UnexpectedEof => "stream ended inside a frame".to_string(),
        _ => err.to_string(),
    };
    NetworkError::Transport { reason }.into()
}
