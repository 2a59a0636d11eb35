use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};

/// Frames larger than this are a protocol violation for a leech that never
/// requests content pieces.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Length-prefix framing over a peer TCP stream, with per-operation
/// deadlines. Every read carries `read_timeout`; expiry surfaces as
/// [`PeerError::Timeout`] and fails the session.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    read_timeout: Duration,
}

impl PeerTransport {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            read_timeout,
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn read_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill_to(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.stream.write_all(data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        self.fill_to(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "frame too large: {} bytes",
                length
            )));
        }

        self.fill_to(4 + length).await?;
        self.read_buf.advance(4);
        let frame = self.read_buf.split_to(length);
        Message::decode(frame.freeze())
    }

    async fn fill_to(&mut self, len: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < len {
            let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}
