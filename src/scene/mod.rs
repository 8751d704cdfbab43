//! Scene model
//!
//! The controller owns the authoritative [`SceneGraph`]; renderers hold
//! read-only mirrors replaced wholesale on every replication broadcast.
//! Window order is front-to-back: the first window is frontmost, and
//! renderers paint the list in reverse so later draws land on top.

mod cursor;
mod graph;
mod window;

pub use cursor::{Cursor, CURSOR_STALE_SECS};
pub use graph::SceneGraph;
pub use window::{ContentKind, ContentWindow, ControlFlags};

/// Content-change notifications exposed to the draw layer and the decode
/// scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// A content window was added for this URI
    WindowAdded(String),
    /// The window for this URI was removed
    WindowRemoved(String),
    /// Window geometry or control state changed
    WindowUpdated(String),
}
