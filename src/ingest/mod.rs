//! TCP ingest for externally produced pixel streams
//!
//! Producers connect to the controller, exchange a protocol version, then
//! push frames as `Open` / `Segment`* / `FinishFrame` sequences. Segments
//! accumulate per URI and are committed as one frame when `FinishFrame`
//! arrives. Interaction events flow the other way: a producer that sends
//! `BindEvents` gets wall input for its URI written back as `Event` frames.
//!
//! Each connection is handled independently. A malformed message closes
//! the offending connection and nothing else.

mod events;
mod listener;
pub mod protocol;

pub use events::{EventDelivery, EventRegistry};
pub use listener::IngestListener;
pub use protocol::{InteractionEvent, ProtocolError, PROTOCOL_VERSION};

use crate::stream::Segment;

/// What the listener reports back to the wall controller.
#[derive(Debug)]
pub enum IngestEvent {
    /// A producer announced a new stream.
    StreamOpened { uri: String },
    /// A complete frame is ready to hand to the stream manager.
    FrameComplete { uri: String, segments: Vec<Segment> },
    /// The producer quit, or its connection dropped.
    StreamClosed { uri: String },
}
