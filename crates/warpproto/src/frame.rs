//! Length-prefixed framing for the gateway link: `u32` big-endian payload
//! length, then the payload.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary; mid-frame EOF is an
/// error.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match rd.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }

    let mut buf = BytesMut::zeroed(len);
    rd.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too big"))?;
    wr.write_all(&len.to_be_bytes()).await?;
    wr.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_frames() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(&read_frame(&mut b).await.unwrap().unwrap()[..], b"hello");
        assert_eq!(&read_frame(&mut b).await.unwrap().unwrap()[..], b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
