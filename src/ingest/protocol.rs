//! Pixel-stream wire protocol framing.
//!
//! Every message is a fixed-size header, `{i32 type; [u8; 256] uri;
//! i32 payload_size}` (little-endian, URI NUL-padded), followed by
//! `payload_size` raw bytes. Segment payloads start with a fixed
//! segment-parameters record; event payloads are a fixed interaction
//! record. A 4-byte protocol version is exchanged at connect time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::geometry::PixelRect;

/// Bumped on every incompatible framing change.
pub const PROTOCOL_VERSION: i32 = 4;

/// Fixed URI field width inside the header.
pub const URI_LEN: usize = 256;

/// Errors raised while framing or parsing protocol messages. Any of these
/// closes the offending connection; other connections are unaffected.
#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    /// Peer speaks a different protocol version
    VersionMismatch { ours: i32, theirs: i32 },
    /// Header type field is not a known message type
    UnknownMessageType(i32),
    /// URI field is not valid UTF-8 or exceeds the fixed width
    BadUri(String),
    /// Payload shorter than its fixed-size record requires
    Truncated { expected: usize, got: usize },
    /// Segment rectangle extends past addressable pixel space
    BadSegmentRect(PixelRect),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "Protocol I/O error: {}", e),
            ProtocolError::VersionMismatch { ours, theirs } => {
                write!(f, "Protocol version mismatch: ours {}, theirs {}", ours, theirs)
            }
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type {}", t),
            ProtocolError::BadUri(msg) => write!(f, "Bad URI field: {}", msg),
            ProtocolError::Truncated { expected, got } => {
                write!(f, "Truncated payload: expected {} bytes, got {}", expected, got)
            }
            ProtocolError::BadSegmentRect(rect) => {
                write!(
                    f,
                    "Segment rect {}x{} at ({}, {}) leaves pixel space",
                    rect.width, rect.height, rect.x, rect.y
                )
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// Pixel-stream message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Create the named stream and its content window
    Open = 0,
    /// One segment of the frame being assembled
    Segment = 1,
    /// The assembled frame is complete; promote it
    FinishFrame = 2,
    /// Register this connection for interaction events
    BindEvents = 3,
    /// Close the stream and remove its window
    Quit = 4,
    /// Server -> client interaction event
    Event = 5,
}

impl TryFrom<i32> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(MessageType::Open),
            1 => Ok(MessageType::Segment),
            2 => Ok(MessageType::FinishFrame),
            3 => Ok(MessageType::BindEvents),
            4 => Ok(MessageType::Quit),
            5 => Ok(MessageType::Event),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageType,
    pub uri: String,
    pub payload_size: u32,
}

impl MessageHeader {
    /// Encoded size: type + URI field + payload size.
    pub const SIZE: usize = 4 + URI_LEN + 4;

    pub fn new(kind: MessageType, uri: &str, payload_size: u32) -> Self {
        Self {
            kind,
            uri: uri.to_string(),
            payload_size,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.uri.len() >= URI_LEN {
            return Err(ProtocolError::BadUri(format!(
                "URI of {} bytes exceeds the {}-byte field",
                self.uri.len(),
                URI_LEN
            )));
        }
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_i32_le(self.kind as i32);
        buf.put_slice(self.uri.as_bytes());
        buf.put_bytes(0, URI_LEN - self.uri.len());
        buf.put_u32_le(self.payload_size);
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let mut buf = bytes;
        let kind = MessageType::try_from(buf.get_i32_le())?;
        let uri_field = &buf[..URI_LEN];
        let end = uri_field.iter().position(|&b| b == 0).unwrap_or(URI_LEN);
        let uri = std::str::from_utf8(&uri_field[..end])
            .map_err(|e| ProtocolError::BadUri(e.to_string()))?
            .to_string();
        buf.advance(URI_LEN);
        let payload_size = buf.get_u32_le();
        Ok(Self {
            kind,
            uri,
            payload_size,
        })
    }
}

/// Fixed record at the front of every segment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentParameters {
    pub rect: PixelRect,
    pub compressed: bool,
}

impl SegmentParameters {
    /// Four u32 rectangle fields plus the compressed flag.
    pub const SIZE: usize = 17;

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.rect.x);
        buf.put_u32_le(self.rect.y);
        buf.put_u32_le(self.rect.width);
        buf.put_u32_le(self.rect.height);
        buf.put_u8(self.compressed as u8);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let mut buf = bytes;
        let rect = PixelRect::new(
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
        );
        if rect.x.checked_add(rect.width).is_none() || rect.y.checked_add(rect.height).is_none() {
            return Err(ProtocolError::BadSegmentRect(rect));
        }
        let compressed = buf.get_u8() != 0;
        Ok(Self { rect, compressed })
    }
}

/// Interaction event kinds delivered back to bound producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Press = 0,
    Release = 1,
    Move = 2,
    Wheel = 3,
    Key = 4,
}

impl TryFrom<i32> for EventKind {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(EventKind::Press),
            1 => Ok(EventKind::Release),
            2 => Ok(EventKind::Move),
            3 => Ok(EventKind::Wheel),
            4 => Ok(EventKind::Key),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Fixed-size interaction record carried by `Event` messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionEvent {
    pub kind: EventKind,
    /// Position normalized to the window
    pub x: f64,
    pub y: f64,
    /// Motion deltas since the last event
    pub dx: f64,
    pub dy: f64,
    /// Mouse button bitmask
    pub buttons: u32,
    /// Key code for `Key` events, 0 otherwise
    pub key: i32,
}

impl InteractionEvent {
    pub const SIZE: usize = 4 + 8 * 4 + 4 + 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_i32_le(self.kind as i32);
        buf.put_f64_le(self.x);
        buf.put_f64_le(self.y);
        buf.put_f64_le(self.dx);
        buf.put_f64_le(self.dy);
        buf.put_u32_le(self.buttons);
        buf.put_i32_le(self.key);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let mut buf = bytes;
        Ok(Self {
            kind: EventKind::try_from(buf.get_i32_le())?,
            x: buf.get_f64_le(),
            y: buf.get_f64_le(),
            dx: buf.get_f64_le(),
            dy: buf.get_f64_le(),
            buttons: buf.get_u32_le(),
            key: buf.get_i32_le(),
        })
    }
}
