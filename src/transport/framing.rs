//! Length-prefixed framing over ordered byte streams.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes. Every
//! transport ends up as a byte stream, so framing is shared.

use crate::utils::{NetworkError, ProtocolError, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > max_frame {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: max_frame,
        }
        .into());
    }
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` on a clean end of stream between frames.
///
/// # Errors
///
/// * `ProtocolError::MessageTooLarge` - the announced length exceeds `max_frame`
/// * `NetworkError::ConnectionClosed` - the stream ended inside a frame
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let mut filled = 0;
    while filled < LEN_SIZE {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: max_frame,
        }
        .into());
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            truncated()
        } else {
            e.into()
        }
    })?;
    Ok(Some(payload))
}

fn truncated() -> crate::utils::MessengerError {
    NetworkError::ConnectionClosed {
        peer: "stream ended inside a frame".to_string(),
    }
    .into()
}

/// Serialize with bincode and write as one frame
pub async fn write_message<W, T>(writer: &mut W, message: &T, max_frame: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    write_frame(writer, &bytes, max_frame).await
}

/// Read one frame and decode it with bincode
pub async fn read_message<R, T>(reader: &mut R, max_frame: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    match read_frame(reader, max_frame).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}
