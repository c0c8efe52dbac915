//! Frames exchanged on a connection.
//!
//! Frame format: `[kind:1][correlation:8][payload:N]`
//!
//! - **kind**: `0` async message, `1` synchronous request, `2` reply,
//!   `3` ping, `4` pong
//! - **correlation**: little-endian u64 pairing a reply with its request or
//!   a pong with its ping (`0` for async messages)
//! - **payload**: opaque application bytes

use std::fmt;

use crate::error::ConnectionError;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Correlation identifier for request/reply pairs.
///
/// Unique per connection, monotonically increasing from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Correlation carried by async frames.
    pub const NONE: CorrelationId = CorrelationId(0);

    /// Create a correlation ID.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr-{}", self.0)
    }
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Fire-and-forget message.
    Async = 0,
    /// Synchronous request expecting a reply.
    Request = 1,
    /// Reply to a request.
    Reply = 2,
    /// Liveness check, answered by the reader.
    Ping = 3,
    /// Answer to a ping.
    Pong = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = ConnectionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Async),
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            3 => Ok(FrameKind::Ping),
            4 => Ok(FrameKind::Pong),
            other => Err(ConnectionError::MalformedFrame(format!(
                "unknown frame kind {}",
                other
            ))),
        }
    }
}

/// One connection frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Correlation ID (`NONE` for async frames).
    pub correlation: CorrelationId,
    /// Application bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Fire-and-forget frame.
    pub fn message(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Async,
            correlation: CorrelationId::NONE,
            payload,
        }
    }

    /// Request frame.
    pub fn request(correlation: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Request,
            correlation,
            payload,
        }
    }

    /// Reply frame.
    pub fn reply(correlation: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Reply,
            correlation,
            payload,
        }
    }

    /// Ping frame carrying sequence number `seq`.
    pub fn ping(seq: CorrelationId) -> Self {
        Self {
            kind: FrameKind::Ping,
            correlation: seq,
            payload: Vec::new(),
        }
    }

    /// Pong answering the ping `seq`.
    pub fn pong(seq: CorrelationId) -> Self {
        Self {
            kind: FrameKind::Pong,
            correlation: seq,
            payload: Vec::new(),
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.encoded_len());
        data.push(self.kind as u8);
        data.extend_from_slice(&self.correlation.value().to_le_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ConnectionError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ConnectionError::MalformedFrame(format!(
                "frame of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let kind = FrameKind::try_from(data[0])?;
        let mut corr = [0u8; 8];
        corr.copy_from_slice(&data[1..FRAME_HEADER_SIZE]);
        Ok(Self {
            kind,
            correlation: CorrelationId::new(u64::from_le_bytes(corr)),
            payload: data[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}
