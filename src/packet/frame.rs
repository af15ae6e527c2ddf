//! Length-delimited framing (u32 little-endian length prefix) over async streams.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {len} > {max}")]
    TooLarge { len: u32, max: u32 },
    #[error("unexpected EOF while reading frame")]
    UnexpectedEof,
}

/// 256 MiB; a 2048x2048 float projection is 16 MiB.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Payload of the acknowledgement sent for every frame in request/confirm mode.
pub const CONFIRM: [u8; 4] = 1i32.to_le_bytes();

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| FrameError::TooLarge { len: u32::MAX, max: DEFAULT_MAX_FRAME_LEN })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// The length is checked against `max_len` before the payload is allocated.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(FrameError::UnexpectedEof),
            n => filled += n,
        }
    }

    let len = u32::from_le_bytes(len_bytes);
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut payload = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })?;
    Ok(Some(payload.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"hello").await?;
            write_frame(&mut a, &[]).await?;
            write_frame(&mut a, &CONFIRM).await?;
            Ok::<_, FrameError>(())
        });

        assert_eq!(read_frame(&mut b, 1024).await?.as_deref(), Some(&b"hello"[..]));
        assert_eq!(read_frame(&mut b, 1024).await?.as_deref(), Some(&[][..]));
        assert_eq!(read_frame(&mut b, 1024).await?.as_deref(), Some(&CONFIRM[..]));
        writer.await??;

        // writer half dropped: clean EOF between frames
        assert!(read_frame(&mut b, 1024).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let result = read_frame(&mut b, 1024).await;
        assert!(matches!(result, Err(FrameError::TooLarge { len: u32::MAX, max: 1024 })));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b, 1024).await, Err(FrameError::UnexpectedEof)));

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 0]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, 1024).await, Err(FrameError::UnexpectedEof)));
    }

    #[test]
    fn confirm_is_little_endian_one() {
        assert_eq!(CONFIRM, [1, 0, 0, 0]);
    }
}
