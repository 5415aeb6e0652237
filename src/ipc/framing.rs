//! Length-prefixed message framing for the control and data sockets.
//!
//! # Wire Format
//!
//! ```text
//! [4-byte big-endian unsigned length][payload]
//! ```
//!
//! A length of zero is the peer's shutdown sentinel and never frames a real
//! payload. Short reads and writes are absorbed here; callers only ever see
//! complete frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RemotingError, Result};

/// Size of the length prefix in bytes.
pub const PREFIX_SIZE: usize = 4;

/// Maximum frame size (1 GiB). A larger prefix means the stream is out of sync.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

/// Read the length prefix of the next frame.
///
/// # Errors
///
/// Returns `RemotingError::ConnectionClosed` if the stream ends before the
/// prefix is complete or if the prefix is zero.
pub async fn read_size<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let size = u32::from_be_bytes(prefix) as usize;

    if size == 0 {
        return Err(RemotingError::ConnectionClosed);
    }

    if size > MAX_FRAME_SIZE {
        return Err(RemotingError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(size)
}

/// Read one length-prefixed frame and return its payload unparsed.
///
/// # Errors
///
/// Returns an error if:
/// - The stream is closed (EOF) or the prefix is zero (`ConnectionClosed`)
/// - The prefix exceeds `MAX_FRAME_SIZE`
/// - The payload cannot be read completely
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let size = read_size(reader).await?;

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;

    Ok(payload)
}

/// Write one length-prefixed frame and flush.
///
/// Prefix and payload go out in a single buffer so a frame is one logical
/// write.
///
/// # Errors
///
/// Returns `RemotingError::Protocol` for an empty payload (zero is the
/// shutdown sentinel) or one that does not fit the prefix, and propagates
/// write/flush failures.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.is_empty() {
        return Err(RemotingError::Protocol(
            "Cannot frame an empty payload".to_string(),
        ));
    }

    if payload.len() > MAX_FRAME_SIZE {
        return Err(RemotingError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(PREFIX_SIZE + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buffer.extend_from_slice(payload);

    writer.write_all(&buffer).await?;
    writer.flush().await?;

    Ok(())
}
