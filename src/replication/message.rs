//! Framing for the state-broadcast channel
//!
//! Same shape as the ingest framing but with the payload size first, so a
//! renderer can pre-size its receive buffer before it learns what the
//! message is. All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ReplicationError;
use crate::ingest::protocol::{SegmentParameters, URI_LEN};
use crate::stream::Segment;

/// What a replication frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Full serialized scene graph.
    SceneGraph = 0,
    /// Pixel-stream segments relayed from the ingest listener.
    SegmentRelay = 1,
    /// One-shot content-dimensions query for a stream URI.
    DimensionsRequest = 2,
    DimensionsReply = 3,
    /// Terminal message. Renderers stop their receive and draw loops.
    Quit = 4,
    /// Renderer acknowledgement closing a publish barrier.
    Ack = 5,
    /// Controller asking every renderer for its in-flight decode count
    /// before relaying the next frame of a stream.
    DecodeQuery = 6,
    DecodeReply = 7,
}

impl TryFrom<i32> for ReplicationMessageType {
    type Error = ReplicationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SceneGraph),
            1 => Ok(Self::SegmentRelay),
            2 => Ok(Self::DimensionsRequest),
            3 => Ok(Self::DimensionsReply),
            4 => Ok(Self::Quit),
            5 => Ok(Self::Ack),
            6 => Ok(Self::DecodeQuery),
            7 => Ok(Self::DecodeReply),
            other => Err(ReplicationError::Protocol(format!(
                "Unknown replication message type {}",
                other
            ))),
        }
    }
}

/// Fixed header preceding every replication payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationHeader {
    pub payload_size: u32,
    pub kind: ReplicationMessageType,
    pub uri: String,
}

impl ReplicationHeader {
    pub const SIZE: usize = 4 + 4 + URI_LEN;

    pub fn new(kind: ReplicationMessageType, uri: &str, payload_size: u32) -> Self {
        Self {
            payload_size,
            kind,
            uri: uri.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ReplicationError> {
        if self.uri.len() >= URI_LEN {
            return Err(ReplicationError::Protocol(format!(
                "URI of {} bytes exceeds the {}-byte field",
                self.uri.len(),
                URI_LEN
            )));
        }
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.payload_size);
        buf.put_i32_le(self.kind as i32);
        buf.put_slice(self.uri.as_bytes());
        buf.put_bytes(0, URI_LEN - self.uri.len());
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        if bytes.len() < Self::SIZE {
            return Err(ReplicationError::Protocol(format!(
                "Header truncated to {} bytes",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let payload_size = buf.get_u32_le();
        let kind = ReplicationMessageType::try_from(buf.get_i32_le())?;
        let uri_field = &buf[..URI_LEN];
        let end = uri_field.iter().position(|&b| b == 0).unwrap_or(URI_LEN);
        let uri = std::str::from_utf8(&uri_field[..end])
            .map_err(|e| ReplicationError::Protocol(format!("URI is not UTF-8: {}", e)))?
            .to_string();
        Ok(Self {
            payload_size,
            kind,
            uri,
        })
    }
}

/// Pack a segment set for relay to the renderers.
pub fn encode_segments(segments: &[Segment]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(segments.len() as u32);
    for segment in segments {
        SegmentParameters {
            rect: segment.rect,
            compressed: segment.compressed,
        }
        .encode_into(&mut buf);
        buf.put_u32_le(segment.data.len() as u32);
        buf.put_slice(&segment.data);
    }
    buf.freeze()
}

pub fn decode_segments(bytes: &[u8]) -> Result<Vec<Segment>, ReplicationError> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err(ReplicationError::Protocol(
            "Segment relay payload truncated".to_string(),
        ));
    }
    let count = buf.get_u32_le() as usize;
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < SegmentParameters::SIZE + 4 {
            return Err(ReplicationError::Protocol(
                "Segment relay payload truncated".to_string(),
            ));
        }
        let params = SegmentParameters::decode(&buf[..SegmentParameters::SIZE])
            .map_err(|e| ReplicationError::Protocol(e.to_string()))?;
        buf.advance(SegmentParameters::SIZE);
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(ReplicationError::Protocol(
                "Segment relay payload truncated".to_string(),
            ));
        }
        segments.push(Segment {
            rect: params.rect,
            compressed: params.compressed,
            data: Bytes::copy_from_slice(&buf[..len]),
        });
        buf.advance(len);
    }
    Ok(segments)
}

/// Payload of a [`ReplicationMessageType::DimensionsReply`].
pub fn encode_dimensions(dims: Option<(u32, u32)>) -> Bytes {
    let (w, h) = dims.unwrap_or((0, 0));
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(w);
    buf.put_u32_le(h);
    buf.freeze()
}

pub fn decode_dimensions(bytes: &[u8]) -> Result<Option<(u32, u32)>, ReplicationError> {
    if bytes.len() < 8 {
        return Err(ReplicationError::Protocol(
            "Dimensions reply truncated".to_string(),
        ));
    }
    let mut buf = bytes;
    let w = buf.get_u32_le();
    let h = buf.get_u32_le();
    Ok(if w == 0 && h == 0 { None } else { Some((w, h)) })
}

/// Payload of a [`ReplicationMessageType::DecodeReply`].
pub fn encode_in_flight(count: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(count);
    buf.freeze()
}

pub fn decode_in_flight(bytes: &[u8]) -> Result<u32, ReplicationError> {
    if bytes.len() < 4 {
        return Err(ReplicationError::Protocol(
            "Decode reply truncated".to_string(),
        ));
    }
    let mut buf = bytes;
    Ok(buf.get_u32_le())
}
