//! Length-prefixed framing over rendezvous byte streams
//!
//! Each message is prefixed with a 4-byte big-endian length header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame size (bytes)
pub const MAX_FRAME: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("zero-length frame")]
    ZeroLength,
    #[error("stream closed mid-frame")]
    Truncated,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a payload with its length prefix.
pub fn frame_packet(data: &[u8]) -> Result<Bytes, FrameError> {
    if data.is_empty() {
        return Err(FrameError::ZeroLength);
    }
    if data.len() > MAX_FRAME {
        return Err(FrameError::TooLarge(data.len()));
    }
    let mut framed = BytesMut::with_capacity(HEADER_LEN + data.len());
    framed.put_u32(data.len() as u32);
    framed.extend_from_slice(data);
    Ok(framed.freeze())
}

/// Stateful decoder for length-prefixed streams.
///
/// Handles partial reads across segment boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    /// Append received bytes to the internal buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, if available
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 {
            return Err(FrameError::ZeroLength);
        }
        if length > MAX_FRAME {
            return Err(FrameError::TooLarge(length));
        }
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(length).freeze()))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take any buffered bytes not yet returned as a frame
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buf.split()
    }
}

/// Read one complete frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return if decoder.is_empty() { Ok(None) } else { Err(FrameError::Truncated) };
        }
        decoder.extend(&chunk[..n]);
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_packet(data)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let framed = frame_packet(b"hello world").unwrap();
        assert_eq!(&framed[..4], &[0, 0, 0, 11]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Bytes::from_static(b"hello world"));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_take_remaining_keeps_unread_bytes() {
        let mut stream = frame_packet(b"hello").unwrap().to_vec();
        let next = frame_packet(b"offer").unwrap();
        stream.extend_from_slice(&next[..3]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(&decoder.take_remaining()[..], &next[..3]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_partial_reads() {
        let mut stream = frame_packet(b"first").unwrap().to_vec();
        stream.extend_from_slice(&frame_packet(b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in stream {
            decoder.extend(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    }

    #[test]
    fn test_rejects_zero_and_oversized() {
        assert!(matches!(frame_packet(b""), Err(FrameError::ZeroLength)));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 0]);
        assert!(matches!(decoder.next_frame(), Err(FrameError::ZeroLength)));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME as u32) + 1).to_be_bytes());
        assert!(matches!(decoder.next_frame(), Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &[9u8; 300]).await.unwrap();
            write_frame(&mut a, b"tail").await.unwrap();
        });
        let mut decoder = FrameDecoder::new();
        assert_eq!(read_frame(&mut b, &mut decoder).await.unwrap().unwrap().len(), 300);
        assert_eq!(read_frame(&mut b, &mut decoder).await.unwrap().unwrap(), Bytes::from_static(b"tail"));
        writer.await.unwrap();
        assert!(read_frame(&mut b, &mut decoder).await.unwrap().is_none());
    }
}
