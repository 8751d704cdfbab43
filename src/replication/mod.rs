//! Controller-to-renderer state replication
//!
//! The controller owns the authoritative scene graph and fans it out to
//! every renderer over persistent TCP links. Each publish is a barrier:
//! a fixed header goes point-to-point to each renderer (so it can size
//! its receive buffer), the payload follows, and the publish returns only
//! after every renderer has acknowledged. The cluster therefore runs at
//! the pace of its slowest member, which is exactly what keeps the wall
//! visually coherent.
//!
//! A second, independent channel carries only clock readings. The clock
//! source is renderer rank 0; the controller calibrates against it once
//! at startup and the remaining renderers follow its periodic ticks.

mod channel;
mod clock;
pub mod message;

pub use channel::{ReplicationUpdate, ScenePublisher, SceneReceiver};
pub use clock::{ClockClient, ClockServer, WallClock};

/// Errors crossing the replication seam.
#[derive(Debug)]
pub enum ReplicationError {
    Io(std::io::Error),
    /// Scene serialization failed. Fatal on the controller: publishing a
    /// partial graph would desynchronize the cluster.
    Encode(serde_json::Error),
    /// A peer sent something the framing does not allow.
    Protocol(String),
    /// A renderer link dropped mid-publish.
    Disconnected,
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Replication I/O error: {}", e),
            Self::Encode(e) => write!(f, "Scene serialization failed: {}", e),
            Self::Protocol(msg) => write!(f, "Replication protocol violation: {}", msg),
            Self::Disconnected => write!(f, "Renderer link disconnected"),
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e)
    }
}
