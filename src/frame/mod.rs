//! Wire framing for multiplexed streams.
//!
//! Frames carry one logical stream's traffic over a shared connection,
//! HTTP/2-style. The fixed 8-byte header is:
//!
//! ```text
//! +-----------------+--------+--------+-----------------+
//! | length (u24 BE) | type   | flags  | stream id (u24) |
//! +-----------------+--------+--------+-----------------+
//! ```
//!
//! followed by `length` payload bytes. Stream id 0 addresses the connection
//! itself (connection-level WINDOW_UPDATE). The codec is sans-I/O: it
//! consumes complete frames from a [`BytesMut`] and leaves partial input
//! untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload this endpoint will accept in a single frame (1 MiB).
///
/// The u24 length field allows more; anything above this is treated as a
/// protocol error rather than buffered.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Largest stream id expressible on the wire (u24).
pub const MAX_STREAM_ID: u32 = (1 << 24) - 1;

/// Flag bit: this frame ends its sender's side of the stream.
pub const FLAG_END_STREAM: u8 = 0x1;

/// Reset error codes carried in RESET frame payloads.
pub mod reset_code {
    /// The peer violated the framing or stream protocol.
    pub const PROTOCOL_ERROR: u32 = 0x1;
    /// The endpoint failed internally while serving the stream.
    pub const INTERNAL_ERROR: u32 = 0x2;
    /// The peer sent more data than its flow-control credit allowed.
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    /// The stream is no longer needed.
    pub const CANCEL: u32 = 0x8;
    /// The request exceeded the size this endpoint accepts.
    pub const PAYLOAD_TOO_LARGE: u32 = 0xb;
}

/// Frame types understood by this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Body bytes, subject to flow control.
    Data = 0x0,
    /// A serialized request or response head. Never consumes window.
    Headers = 0x1,
    /// Abrupt stream termination with an error code.
    Reset = 0x3,
    /// Flow-control credit for a stream (or the connection, id 0).
    WindowUpdate = 0x8,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x3 => Self::Reset,
            0x8 => Self::WindowUpdate,
            _ => return None,
        })
    }
}

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    #[error("frame payload of {len} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversized { len: usize },

    #[error("stream id {id} exceeds the wire maximum")]
    StreamIdOverflow { id: u32 },

    #[error("{kind:?} frame has a malformed payload of {len} bytes")]
    BadPayload { kind: FrameType, len: usize },
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a HEADERS frame carrying a serialized head.
    pub fn headers(stream_id: u32, payload: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            kind: FrameType::Headers,
            flags: if end_stream { FLAG_END_STREAM } else { 0 },
            payload,
        }
    }

    /// Builds a DATA frame carrying body bytes.
    pub fn data(stream_id: u32, payload: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            kind: FrameType::Data,
            flags: if end_stream { FLAG_END_STREAM } else { 0 },
            payload,
        }
    }

    /// Builds a WINDOW_UPDATE frame granting `credit` bytes.
    ///
    /// Stream id 0 grants credit on the connection-level window.
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self {
            stream_id,
            kind: FrameType::WindowUpdate,
            flags: 0,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    /// Builds a RESET frame carrying an error code from [`reset_code`].
    pub fn reset(stream_id: u32, code: u32) -> Self {
        Self {
            stream_id,
            kind: FrameType::Reset,
            flags: 0,
            payload: Bytes::copy_from_slice(&code.to_be_bytes()),
        }
    }

    /// Returns `true` if this frame carries the END_STREAM flag.
    pub fn end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    /// Reads the credit of a WINDOW_UPDATE payload.
    pub fn credit(&self) -> Result<u32, FrameError> {
        self.u32_payload()
    }

    /// Reads the error code of a RESET payload.
    pub fn error_code(&self) -> Result<u32, FrameError> {
        self.u32_payload()
    }

    fn u32_payload(&self) -> Result<u32, FrameError> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::BadPayload {
                kind: self.kind,
                len: self.payload.len(),
            })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Serializes this frame onto `buf`.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Oversized`] — the payload exceeds [`MAX_PAYLOAD`].
    /// - [`FrameError::StreamIdOverflow`] — the stream id does not fit in u24.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversized { len });
        }
        if self.stream_id > MAX_STREAM_ID {
            return Err(FrameError::StreamIdOverflow { id: self.stream_id });
        }

        buf.reserve(HEADER_LEN + len);
        buf.put_uint(len as u64, 3);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_uint(self.stream_id as u64, 3);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Consumes one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame;
    /// the buffer is left untouched so more bytes can be appended.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversized { len });
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let raw_kind = buf[3];
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]);
        let kind = FrameType::from_u8(raw_kind).ok_or(FrameError::UnknownType(raw_kind))?;

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();

        Ok(Some(Self {
            stream_id,
            kind,
            flags,
            payload,
        }))
    }
}
