use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::protocol::error::TransportError;

/// Largest inbound frame accepted before the connection is considered corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Persistent TCP connection framed with a self-inclusive u32 length prefix.
pub struct TcpTransport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|error| TransportError::Connect(addr.to_owned(), error))?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader {
                stream: read,
                buffer: BytesMut::with_capacity(8 * 1024),
            },
            writer: FrameWriter { stream: write, peer },
        }
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read half yielding whole frames without their length prefix.
pub struct FrameReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

impl FrameReader {
    /// Reads the next complete frame.
    pub async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            if let Some(frame) = pop_frame(&mut self.buffer)? {
                return Ok(frame);
            }

            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

/// Write half accepting fully built frames.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
    peer: Option<std::net::SocketAddr>,
}

impl FrameWriter {
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.peer
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Pops one frame from `buffer`, returning it without the prefix.
pub fn pop_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
    if buffer.len() < 4 {
        return Ok(None);
    }

    let full_frame_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if full_frame_len < 4 {
        return Err(TransportError::InvalidFrame(full_frame_len));
    }
    if full_frame_len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(full_frame_len));
    }
    if buffer.len() < full_frame_len {
        return Ok(None);
    }

    let mut frame = buffer.split_to(full_frame_len);
    frame.advance(4);
    Ok(Some(frame.freeze()))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::pop_frame;
    use crate::protocol::error::TransportError;

    #[test]
    fn pops_complete_frames_only() {
        let mut buffer = BytesMut::from(&[0, 0, 0, 6, 0xAA, 0xBB, 0, 0, 0][..]);
        let frame = pop_frame(&mut buffer).ok().flatten();
        assert_eq!(frame.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert!(matches!(pop_frame(&mut buffer), Ok(None)));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn rejects_oversize_frames() {
        let mut buffer = BytesMut::from(&[0x7F, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(
            pop_frame(&mut buffer),
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
