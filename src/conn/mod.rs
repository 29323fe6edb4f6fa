//! Buffered frame-oriented connection over TCP.
//!
//! A [`Connection`] wraps one socket with a read buffer that accumulates
//! bytes until a complete frame can be decoded, and an encode scratch
//! buffer for writes. A connection is owned by exactly one task for its
//! lifetime; all reads and writes on it are serialized, and a connection
//! stalled on I/O never blocks others (tokio's readiness scheduling).

use std::net::SocketAddr;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::frame::{Frame, FrameError};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Errors produced by connection I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("peer closed the connection mid-frame")]
    TruncatedFrame,
}

/// A bidirectional frame transport over one TCP socket.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    /// Wraps an accepted socket.
    ///
    /// Write coalescing is disabled by default: small frames go out
    /// immediately rather than waiting for the kernel to batch them.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer_addr,
            read_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            write_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        })
    }

    /// Opens a client connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, addr)
    }

    /// Returns the peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Controls whether small outbound writes may be queued briefly by the
    /// kernel to reduce packet count.
    ///
    /// `false` (the default) sends immediately; `true` re-enables
    /// coalescing (Nagle's algorithm).
    pub fn set_coalesce_writes(&self, coalesce: bool) -> Result<(), ConnectionError> {
        self.stream.set_nodelay(!coalesce)?;
        Ok(())
    }

    /// Reads the next frame from the peer.
    ///
    /// Completes with `Ok(Some(frame))`, `Ok(None)` when the peer closed
    /// the connection gracefully at a frame boundary, or an error. A close
    /// in the middle of a frame is [`ConnectionError::TruncatedFrame`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.read_buf)? {
                trace!(
                    peer = %self.peer_addr,
                    stream_id = frame.stream_id,
                    kind = ?frame.kind,
                    len = frame.payload.len(),
                    "frame received"
                );
                return Ok(Some(frame));
            }

            let bytes_read = self.stream.read_buf(&mut self.read_buf).await?;
            if bytes_read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::TruncatedFrame);
            }
        }
    }

    /// Writes one frame to the peer.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        frame.encode(&mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Flushes buffered writes to the socket.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write side, signalling end of transmission.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
