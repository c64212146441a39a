//! Mux frame encoding
//!
//! Header layout: `stream_id (4) + frame_type (1) + length (4)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::session::MuxError;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream; payload is the stream name
    Open = 0,
    Data = 1,
    Close = 2,
    /// Session-level close; no further frames follow
    GoAway = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + length (4)
    pub const HEADER_SIZE: usize = 9;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    pub fn open(stream_id: StreamId, name: &str) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::copy_from_slice(name.as_bytes()))
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn go_away() -> Self {
        Self::new(0, FrameType::GoAway, Bytes::new())
    }

    /// Encode frame to bytes
    pub fn encode(&self, max_payload: usize) -> Result<Bytes, MuxError> {
        if self.payload.len() > max_payload {
            return Err(MuxError::FrameTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode a frame header; returns `(stream_id, frame_type, payload length)`
    pub fn decode_header(header: &[u8; Self::HEADER_SIZE]) -> Result<(StreamId, FrameType, usize), MuxError> {
        let mut buf = &header[..];
        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let length = buf.get_u32() as usize;
        Ok((stream_id, frame_type, length))
    }
}
